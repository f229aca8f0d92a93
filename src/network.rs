use geo::{Contains, HaversineLength};
use geo_types::{Coord, LineString, Point, Polygon, Rect};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Raw OSM way as returned by Overpass `out geom`.
#[derive(Debug, Clone)]
pub struct Way {
    pub id: i64,
    pub nodes: Vec<i64>,
    pub geometry: Vec<Coord<f64>>,
    pub tags: HashMap<String, String>,
}

impl Way {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    fn direction(&self) -> Direction {
        match self.tag("oneway") {
            Some("yes" | "true" | "1") => Direction::Forward,
            Some("-1" | "reverse") => Direction::Reverse,
            _ if self.tag("junction") == Some("roundabout") => Direction::Forward,
            _ => Direction::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Reverse,
    Both,
}

/// `(u, v, key)`; parallel edges between the same pair get increasing keys.
pub type EdgeKey = (i64, i64, u32);

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub way_id: i64,
    pub highway: Option<String>,
    pub name: Option<String>,
    pub geometry: LineString<f64>,
    pub length_m: f64,
}

/// Simplified directed street graph keyed by OSM node ids.
#[derive(Debug, Clone, Default)]
pub struct StreetNetwork {
    nodes: BTreeMap<i64, Coord<f64>>,
    edges: BTreeMap<EdgeKey, Edge>,
}

impl StreetNetwork {
    /// Build a graph from ways, keeping only nodes inside `boundary`.
    ///
    /// Ways leaving the boundary split into separate runs. Runs are then
    /// simplified so that only endpoints and intersections remain graph nodes;
    /// the points in between fold into the edge geometry. `bidirectional`
    /// ignores one-way tags, as pedestrians may walk either way.
    pub fn from_ways(ways: &[Way], boundary: Option<&Polygon<f64>>, bidirectional: bool) -> Self {
        let runs: Vec<(&Way, Vec<(i64, Coord<f64>)>)> = ways
            .iter()
            .flat_map(|way| {
                inside_runs(way, boundary)
                    .into_iter()
                    .map(move |run| (way, run))
            })
            .collect();

        let mut uses: HashMap<i64, usize> = HashMap::new();
        let mut endpoints: HashSet<i64> = HashSet::new();
        for (_, run) in &runs {
            for (id, _) in run {
                *uses.entry(*id).or_default() += 1;
            }
            if let (Some(first), Some(last)) = (run.first(), run.last()) {
                endpoints.insert(first.0);
                endpoints.insert(last.0);
            }
        }
        let is_graph_node =
            |id: i64| endpoints.contains(&id) || uses.get(&id).is_some_and(|&n| n > 1);

        let mut network = StreetNetwork::default();
        for (way, run) in &runs {
            let direction = if bidirectional {
                Direction::Both
            } else {
                way.direction()
            };

            let mut start = 0;
            for i in 1..run.len() {
                if !is_graph_node(run[i].0) {
                    continue;
                }
                let piece = &run[start..=i];
                let (u, cu) = piece[0];
                let (v, cv) = piece[piece.len() - 1];
                network.nodes.insert(u, cu);
                network.nodes.insert(v, cv);

                let coords: Vec<Coord<f64>> = piece.iter().map(|(_, c)| *c).collect();
                if matches!(direction, Direction::Forward | Direction::Both) {
                    network.add_edge(u, v, way, LineString::from(coords.clone()));
                }
                if matches!(direction, Direction::Reverse | Direction::Both) {
                    let mut rev = coords;
                    rev.reverse();
                    network.add_edge(v, u, way, LineString::from(rev));
                }
                start = i;
            }
        }
        network
    }

    fn add_edge(&mut self, u: i64, v: i64, way: &Way, geometry: LineString<f64>) {
        let key = (0..)
            .find(|k| !self.edges.contains_key(&(u, v, *k)))
            .unwrap_or_default();
        let length_m = geometry.haversine_length();
        self.edges.insert(
            (u, v, key),
            Edge {
                way_id: way.id,
                highway: way.tag("highway").map(str::to_string),
                name: way.tag("name").map(str::to_string),
                geometry,
                length_m,
            },
        );
    }

    /// Drop everything outside the largest weakly connected component. Ties go
    /// to the component holding the lowest node id.
    pub fn retain_largest_component(&mut self) {
        let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
        for &(u, v, _) in self.edges.keys() {
            adjacency.entry(u).or_default().push(v);
            adjacency.entry(v).or_default().push(u);
        }

        let mut component: HashMap<i64, usize> = HashMap::new();
        let mut largest = (0, 0);
        let mut next_id = 0;
        for &start in self.nodes.keys() {
            if component.contains_key(&start) {
                continue;
            }
            let id = next_id;
            next_id += 1;
            component.insert(start, id);
            let mut stack = vec![start];
            let mut size = 0;
            while let Some(node) = stack.pop() {
                size += 1;
                for &next in adjacency.get(&node).into_iter().flatten() {
                    if !component.contains_key(&next) {
                        component.insert(next, id);
                        stack.push(next);
                    }
                }
            }
            if size > largest.1 {
                largest = (id, size);
            }
        }

        let keep = |node: &i64| component.get(node) == Some(&largest.0);
        let before = self.nodes.len();
        self.nodes.retain(|node, _| keep(node));
        self.edges.retain(|(u, _, _), _| keep(u));
        if self.nodes.len() < before {
            tracing::debug!(
                "Dropped {} nodes outside the largest connected component",
                before - self.nodes.len()
            );
        }
    }

    /// Graph union. Nodes and edges already present are overwritten by `other`.
    pub fn compose(&mut self, other: StreetNetwork) {
        self.nodes.extend(other.nodes);
        self.edges.extend(other.edges);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&EdgeKey, &Edge)> {
        self.edges.iter()
    }

    pub fn total_length_m(&self) -> f64 {
        self.edges.values().map(|e| e.length_m).sum()
    }

    /// Edge length in metres per `highway` tag; untagged edges count as "other".
    pub fn length_by_highway(&self) -> BTreeMap<String, f64> {
        let mut totals = BTreeMap::new();
        for edge in self.edges.values() {
            let class = edge.highway.as_deref().unwrap_or("other");
            *totals.entry(class.to_string()).or_insert(0.0) += edge.length_m;
        }
        totals
    }

    pub fn named_street_count(&self) -> usize {
        self.edges
            .values()
            .filter_map(|e| e.name.as_deref())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Bounding box over all edge geometry, `None` for an empty graph.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        let mut coords = self
            .edges
            .values()
            .flat_map(|e| e.geometry.0.iter())
            .chain(self.nodes.values());
        let first = *coords.next()?;
        let (min, max) = coords.fold((first, first), |(lo, hi), c| {
            (
                Coord {
                    x: lo.x.min(c.x),
                    y: lo.y.min(c.y),
                },
                Coord {
                    x: hi.x.max(c.x),
                    y: hi.y.max(c.y),
                },
            )
        });
        Some(Rect::new(min, max))
    }
}

/// Consecutive runs of a way's nodes lying inside `boundary`, each with at
/// least two nodes.
fn inside_runs(way: &Way, boundary: Option<&Polygon<f64>>) -> Vec<Vec<(i64, Coord<f64>)>> {
    if way.nodes.len() != way.geometry.len() || way.nodes.len() < 2 {
        return Vec::new();
    }

    let mut runs = Vec::new();
    let mut current = Vec::new();
    for (&id, &coord) in way.nodes.iter().zip(&way.geometry) {
        let inside = boundary.is_none_or(|poly| poly.contains(&Point::from(coord)));
        if inside {
            current.push((id, coord));
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    runs.push(current);
    runs.retain(|r| r.len() >= 2);
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn way(id: i64, nodes: &[(i64, f64, f64)], tags: &[(&str, &str)]) -> Way {
        Way {
            id,
            nodes: nodes.iter().map(|n| n.0).collect(),
            geometry: nodes.iter().map(|n| Coord { x: n.1, y: n.2 }).collect(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn square(min: f64, max: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![(min, min), (max, min), (max, max), (min, max), (min, min)]),
            vec![],
        )
    }

    #[test]
    fn interstitial_nodes_fold_into_edges() {
        let ways = vec![way(
            1,
            &[(1, 0.0, 0.0), (2, 0.001, 0.0), (3, 0.002, 0.0)],
            &[("highway", "residential"), ("name", "Main St")],
        )];
        let g = StreetNetwork::from_ways(&ways, None, false);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 2);
        let (_, edge) = g.edges().next().unwrap();
        assert_eq!(edge.geometry.0.len(), 3);
        assert_eq!(edge.name.as_deref(), Some("Main St"));
        assert_eq!(g.named_street_count(), 1);
        assert_relative_eq!(edge.length_m, 222.39, max_relative = 1e-3);
    }

    #[test]
    fn shared_nodes_become_intersections() {
        let ways = vec![
            way(1, &[(1, 0.0, 0.0), (2, 0.001, 0.0), (3, 0.002, 0.0)], &[]),
            way(2, &[(4, 0.001, -0.001), (2, 0.001, 0.0), (5, 0.001, 0.001)], &[]),
        ];
        let g = StreetNetwork::from_ways(&ways, None, false);
        assert_eq!(g.node_count(), 5);
        assert_eq!(g.edge_count(), 8);
    }

    #[test]
    fn oneway_tags_control_direction() {
        let fwd = way(1, &[(1, 0.0, 0.0), (2, 0.001, 0.0)], &[("oneway", "yes")]);
        let rev = way(2, &[(3, 0.0, 1.0), (4, 0.001, 1.0)], &[("oneway", "-1")]);
        let g = StreetNetwork::from_ways(&[fwd.clone(), rev], None, false);
        let keys: Vec<EdgeKey> = g.edges().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(1, 2, 0), (4, 3, 0)]);

        let walk = StreetNetwork::from_ways(&[fwd], None, true);
        assert_eq!(walk.edge_count(), 2);
    }

    #[test]
    fn boundary_splits_ways_into_runs() {
        let ways = vec![way(
            1,
            &[
                (1, 0.1, 0.5),
                (2, 0.2, 0.5),
                (3, 2.0, 0.5),
                (4, 0.3, 0.6),
                (5, 0.4, 0.6),
            ],
            &[("oneway", "yes")],
        )];
        let g = StreetNetwork::from_ways(&ways, Some(&square(0.0, 1.0)), false);
        let keys: Vec<EdgeKey> = g.edges().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(1, 2, 0), (4, 5, 0)]);
    }

    #[test]
    fn compose_unions_and_prefers_other() {
        let a = StreetNetwork::from_ways(
            &[way(1, &[(1, 0.0, 0.0), (2, 0.001, 0.0)], &[("highway", "primary")])],
            None,
            false,
        );
        let b = StreetNetwork::from_ways(
            &[
                way(1, &[(1, 0.0, 0.0), (2, 0.001, 0.0)], &[("highway", "cycleway")]),
                way(2, &[(2, 0.001, 0.0), (3, 0.002, 0.0)], &[]),
            ],
            None,
            false,
        );
        let mut combined = a;
        combined.compose(b);
        assert_eq!(combined.node_count(), 3);
        assert_eq!(combined.edge_count(), 4);
        let first = combined.edges().next().unwrap().1;
        assert_eq!(first.highway.as_deref(), Some("cycleway"));

        let by_class = combined.length_by_highway();
        assert_eq!(by_class.keys().collect::<Vec<_>>(), vec!["cycleway", "other"]);
        assert_abs_diff_eq!(
            by_class.values().sum::<f64>(),
            combined.total_length_m(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn only_the_largest_component_is_kept() {
        let mut g = StreetNetwork::from_ways(
            &[
                way(1, &[(1, 0.0, 0.0), (2, 0.001, 0.0)], &[]),
                way(2, &[(10, 1.0, 1.0), (11, 1.001, 1.0)], &[("oneway", "yes")]),
                way(3, &[(11, 1.001, 1.0), (12, 1.002, 1.0)], &[("oneway", "yes")]),
            ],
            None,
            false,
        );
        assert_eq!(g.node_count(), 5);
        g.retain_largest_component();
        assert_eq!(g.node_count(), 3);
        let keys: Vec<EdgeKey> = g.edges().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(10, 11, 0), (11, 12, 0)]);
    }

    #[test]
    fn bounds_cover_geometry() {
        let g = StreetNetwork::from_ways(
            &[way(1, &[(1, -1.0, 2.0), (2, 0.5, 0.0), (3, 3.0, 1.0)], &[])],
            None,
            false,
        );
        let b = g.bounds().unwrap();
        assert_eq!(b.min(), Coord { x: -1.0, y: 0.0 });
        assert_eq!(b.max(), Coord { x: 3.0, y: 2.0 });
        assert!(StreetNetwork::default().bounds().is_none());
    }
}
