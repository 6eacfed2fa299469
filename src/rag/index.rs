//! 图结构近似最近邻索引（Navigable Small World）
//!
//! - 构建参数：m（每个节点的双向连接数）、ef_construction（插入时的候选宽度）
//! - 查询参数：ef_search（查询时的候选宽度，越大召回越高、越慢，应不小于 k）
//!
//! 相似度为余弦相似度；删除采用墓碑标记，节点仍参与图遍历但不再出现在结果中。
//! 同一份冻结的索引对相同查询总是返回相同的有序结果。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// 索引构建参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexParams {
    pub m: usize,
    pub ef_construction: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
        }
    }
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 堆元素：相似度高者大；相似度相同时 id 小者大
#[derive(Debug, Clone, Copy)]
struct Scored {
    sim: f32,
    id: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .total_cmp(&other.sim)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    params: IndexParams,
    vectors: Vec<Vec<f32>>,
    neighbors: Vec<Vec<usize>>,
    deleted: Vec<bool>,
    entry: Option<usize>,
}

impl GraphIndex {
    pub fn new(params: IndexParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    /// 存活节点数
    pub fn len(&self) -> usize {
        self.deleted.iter().filter(|d| !**d).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 插入向量，返回节点 id
    pub fn insert(&mut self, vector: Vec<f32>) -> usize {
        let id = self.vectors.len();
        let nearest = match self.entry {
            Some(entry) => {
                let ef = self.params.ef_construction.max(self.params.m);
                let visited = self.beam_search(&vector, entry, ef);
                visited
                    .into_iter()
                    .take(self.params.m.max(1))
                    .map(|s| s.id)
                    .collect()
            }
            None => Vec::new(),
        };

        self.vectors.push(vector);
        self.neighbors.push(nearest.clone());
        self.deleted.push(false);
        if self.entry.is_none() {
            self.entry = Some(id);
        }

        for n in nearest {
            self.neighbors[n].push(id);
            self.prune(n);
        }
        id
    }

    /// 墓碑删除
    pub fn remove(&mut self, id: usize) {
        if let Some(flag) = self.deleted.get_mut(id) {
            *flag = true;
        }
    }

    /// 查询最相似的 k 个存活且被 accept 接受的节点，按相似度降序
    pub fn search<F>(&self, query: &[f32], k: usize, ef_search: usize, accept: F) -> Vec<(usize, f32)>
    where
        F: Fn(usize) -> bool,
    {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let visited = self.beam_search(query, entry, ef_search.max(k));
        visited
            .into_iter()
            .filter(|s| !self.deleted[s.id] && accept(s.id))
            .take(k)
            .map(|s| (s.id, s.sim))
            .collect()
    }

    /// 贪心 beam 搜索；返回所有被评估过的节点（相似度降序）
    fn beam_search(&self, query: &[f32], entry: usize, ef: usize) -> Vec<Scored> {
        let ef = ef.max(1);
        let mut visited: HashSet<usize> = HashSet::new();
        let mut evaluated: Vec<Scored> = Vec::new();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        // 以 Reverse 实现最小堆，堆顶为 beam 中最差者
        let mut beam: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();

        let start = Scored {
            sim: cosine_similarity(query, &self.vectors[entry]),
            id: entry,
        };
        visited.insert(entry);
        evaluated.push(start);
        candidates.push(start);
        beam.push(std::cmp::Reverse(start));

        while let Some(current) = candidates.pop() {
            let worst = beam.peek().map(|r| r.0);
            if let Some(worst) = worst {
                if beam.len() >= ef && current < worst {
                    break;
                }
            }
            for &n in &self.neighbors[current.id] {
                if !visited.insert(n) {
                    continue;
                }
                let scored = Scored {
                    sim: cosine_similarity(query, &self.vectors[n]),
                    id: n,
                };
                evaluated.push(scored);
                let worst = beam.peek().map(|r| r.0);
                let admit = beam.len() < ef || worst.map(|w| scored > w).unwrap_or(true);
                if admit {
                    candidates.push(scored);
                    beam.push(std::cmp::Reverse(scored));
                    if beam.len() > ef {
                        beam.pop();
                    }
                }
            }
        }

        evaluated.sort_by(|a, b| b.cmp(a));
        evaluated
    }

    /// 邻居数超过 2m 时只保留最相似的 2m 个
    fn prune(&mut self, id: usize) {
        let max_links = self.params.m.max(1) * 2;
        if self.neighbors[id].len() <= max_links {
            return;
        }
        let base = &self.vectors[id];
        let mut scored: Vec<Scored> = self.neighbors[id]
            .iter()
            .map(|&n| Scored {
                sim: cosine_similarity(base, &self.vectors[n]),
                id: n,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(max_links);
        self.neighbors[id] = scored.into_iter().map(|s| s.id).collect();
    }
}
