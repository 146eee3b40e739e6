/*
* Licensed to Elasticsearch B.V. under one or more contributor
* license agreements. See the NOTICE file distributed with
* this work for additional information regarding copyright
* ownership. Elasticsearch B.V. licenses this file to you under
* the Apache License, Version 2.0 (the "License"); you may
* not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*  http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing,
* software distributed under the License is distributed on an
* "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
* KIND, either express or implied.  See the License for the
* specific language governing permissions and limitations
* under the License.
*/

//! Cluster discovery: targets that can reach each other through shared
//! candidate measurements must be associated jointly. Two targets land in the
//! same cluster exactly when they are connected in the bipartite
//! target↔measurement-key graph; we run union-find over the targets with the
//! keys as the connecting evidence instead of materialising the graph.

use crate::hypotree::{MeasurementKey, MeasurementSet};
use fxhash::FxBuildHasher;
use hashbrown::HashMap;

/// Disjoint-set forest over target indices.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> UnionFind {
        UnionFind {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut walk = i;
        while self.parent[walk] != root {
            let next = self.parent[walk];
            self.parent[walk] = root;
            walk = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index wins so cluster labels are stable.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Partitions the targets into clusters of shared measurement usage.
///
/// Each cluster is an ascending list of target indices; the clusters are
/// ordered by their smallest member. The partition depends only on the sets,
/// not on target order.
pub(crate) fn find_clusters(associated: &[MeasurementSet]) -> Vec<Vec<usize>> {
    let mut forest = UnionFind::new(associated.len());
    let mut first_owner: HashMap<MeasurementKey, usize, FxBuildHasher> = HashMap::default();
    for (target, set) in associated.iter().enumerate() {
        for &key in set.iter() {
            match first_owner.get(&key) {
                Some(&owner) => forest.union(owner, target),
                None => {
                    first_owner.insert(key, target);
                }
            }
        }
    }
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut label: HashMap<usize, usize, FxBuildHasher> = HashMap::default();
    for target in 0..associated.len() {
        let root = forest.find(target);
        match label.get(&root) {
            Some(&cluster) => clusters[cluster].push(target),
            None => {
                label.insert(root, clusters.len());
                clusters.push(vec![target]);
            }
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(keys: &[MeasurementKey]) -> MeasurementSet {
        keys.iter().copied().collect()
    }

    fn radar(scan: usize, number: usize) -> MeasurementKey {
        MeasurementKey::Radar { scan, number }
    }

    #[test]
    fn disjoint_targets_stay_singletons() {
        let sets = vec![
            set(&[radar(1, 1)]),
            set(&[radar(1, 2)]),
            set(&[radar(2, 1)]),
        ];
        // Scan-2 measurement number 1 is a different key than scan-1 number 1.
        assert_eq!(find_clusters(&sets), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn shared_key_merges_targets() {
        let sets = vec![
            set(&[radar(1, 1), radar(2, 3)]),
            set(&[radar(1, 2)]),
            set(&[radar(2, 3)]),
        ];
        assert_eq!(find_clusters(&sets), vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn chains_connect_transitively() {
        let sets = vec![
            set(&[radar(1, 1)]),
            set(&[radar(1, 1), radar(1, 2)]),
            set(&[radar(1, 2), radar(1, 3)]),
            set(&[radar(5, 9)]),
        ];
        assert_eq!(find_clusters(&sets), vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn empty_sets_form_their_own_clusters() {
        let sets = vec![set(&[]), set(&[radar(1, 1)]), set(&[])];
        assert_eq!(find_clusters(&sets), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn partition_is_permutation_stable() {
        let a = set(&[radar(1, 1), radar(2, 2)]);
        let b = set(&[radar(2, 2)]);
        let c = set(&[radar(3, 1)]);
        let forward = find_clusters(&[a.clone(), b.clone(), c.clone()]);
        let backward = find_clusters(&[c, b, a]);
        // Same partition as sets of sets, indices permuted accordingly.
        assert_eq!(forward, vec![vec![0, 1], vec![2]]);
        assert_eq!(backward, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn ais_and_radar_keys_share_the_namespace() {
        let sets = vec![
            set(&[MeasurementKey::Ais {
                scan: 1,
                mmsi: 257_000_001,
            }]),
            set(&[
                MeasurementKey::Ais {
                    scan: 1,
                    mmsi: 257_000_001,
                },
                radar(1, 1),
            ]),
        ];
        assert_eq!(find_clusters(&sets), vec![vec![0, 1]]);
    }
}
