use anyhow::{Context, Result};
use resvg::usvg::fontdb;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::*;

/// Family name embedded in the downloaded font file.
pub const CUSTOM_FAMILY: &str = "Lato";

/// Font database shared by every rasterization. Clones share the database.
#[derive(Clone, Default)]
pub struct FontLibrary {
    db: Arc<fontdb::Database>,
    custom: bool,
}

impl FontLibrary {
    /// System fonts, plus the custom font when one was fetched.
    pub fn load(custom: Option<Vec<u8>>) -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        Self::with_database(db, custom)
    }

    fn with_database(mut db: fontdb::Database, custom: Option<Vec<u8>>) -> Self {
        let before = db.len();
        if let Some(bytes) = custom {
            db.load_font_data(bytes);
        }
        let custom = db.len() > before;
        if !custom {
            tracing::debug!("Rendering with system fonts only");
        }
        Self {
            db: Arc::new(db),
            custom,
        }
    }

    /// Whether the custom family is available to the renderer.
    pub fn has_custom(&self) -> bool {
        self.custom
    }

    pub(crate) fn database(&self) -> Arc<fontdb::Database> {
        self.db.clone()
    }
}

impl fmt::Debug for FontLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FontLibrary")
            .field("faces", &self.db.len())
            .field("custom", &self.custom)
            .finish()
    }
}

/// Load the Lato font, downloading it into `dir` on first use.
///
/// Returns `None` when the font cannot be fetched; rendering then falls back to
/// system fonts.
pub async fn load_custom_font(client: &reqwest::Client, dir: &Path) -> Option<Vec<u8>> {
    match fetch_font(client, dir).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!("Could not load custom font: {e:#}");
            None
        }
    }
}

async fn fetch_font(client: &reqwest::Client, dir: &Path) -> Result<Vec<u8>> {
    let path = dir.join(FONT_FILE);
    if path.exists() {
        return fs::read(&path).with_context(|| format!("Failed to read {}", path.display()));
    }

    let bytes = client
        .get(FONT_URL)
        .send()
        .await
        .context("Failed to download font")?
        .error_for_status()?
        .bytes()
        .await?;

    fs::create_dir_all(dir)?;
    fs::write(&path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!("Font downloaded successfully");
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_font_already_on_disk() {
        let dir = std::env::temp_dir().join(format!("citymap-font-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(FONT_FILE), b"not really a font").unwrap();

        let font = load_custom_font(&reqwest::Client::new(), &dir).await.unwrap();
        assert_eq!(font.as_slice(), b"not really a font");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unparsable_font_is_not_reported_as_custom() {
        let fonts = FontLibrary::with_database(fontdb::Database::new(), Some(b"junk".to_vec()));
        assert!(!fonts.has_custom());
        assert!(!FontLibrary::default().has_custom());
    }
}
