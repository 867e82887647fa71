//! Disjoint-set forest over dense node indices.
//!
//! Union by rank with path compression on the mutating path. Queries that
//! only hold a shared reference use [`DisjointSet::find_readonly`], which
//! walks the same parent chain without rewriting it.

#[derive(Debug, Default, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new singleton and return its index.
    pub fn add(&mut self) -> usize {
        let index = self.parent.len();
        self.parent.push(index);
        self.rank.push(0);
        index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Representative of `node`'s set, compressing the path walked.
    pub fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = node;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Representative of `node`'s set without mutating the forest.
    #[must_use]
    pub fn find_readonly(&self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        root
    }

    /// Merge the sets holding `a` and `b`; returns the surviving root.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let (winner, loser) = if self.rank[ra] >= self.rank[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[loser] = winner;
        if self.rank[winner] == self.rank[loser] {
            self.rank[winner] += 1;
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_are_their_own_roots() {
        let mut dsu = DisjointSet::new();
        let a = dsu.add();
        let b = dsu.add();
        assert_ne!(dsu.find(a), dsu.find(b));
        assert_eq!(dsu.find_readonly(a), a);
    }

    #[test]
    fn test_union_connects_transitively() {
        let mut dsu = DisjointSet::new();
        let nodes: Vec<usize> = (0..4).map(|_| dsu.add()).collect();
        dsu.union(nodes[0], nodes[1]);
        dsu.union(nodes[2], nodes[3]);
        assert_ne!(dsu.find(nodes[0]), dsu.find(nodes[2]));
        dsu.union(nodes[1], nodes[2]);
        let root = dsu.find(nodes[0]);
        assert!(nodes.iter().all(|&n| dsu.find_readonly(n) == root));
    }

    #[test]
    fn test_union_is_idempotent() {
        let mut dsu = DisjointSet::new();
        let a = dsu.add();
        let b = dsu.add();
        let first = dsu.union(a, b);
        assert_eq!(dsu.union(a, b), first);
    }
}
