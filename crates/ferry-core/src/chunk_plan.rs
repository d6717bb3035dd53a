
use crate::model::FileId;

/// Input to the planner: a file identity and its size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlanFile {
    pub id: FileId,
    pub size: u64,
}

/// One bin of the plan. `files` keeps placement order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlannedChunk {
    pub index: u32,
    pub files: Vec<FileId>,
    pub total_size: u64,
}

/// Ordered chunks produced by [`plan_chunks`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkPlan {
    pub budget: u64,
    pub chunks: Vec<PlannedChunk>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.total_size).sum()
    }

    /// Chunks holding a single file larger than the budget.
    pub fn oversized(&self) -> impl Iterator<Item = &PlannedChunk> {
        self.chunks
            .iter()
            .filter(move |chunk| chunk.total_size > self.budget)
    }

    pub fn chunk_of(&self, file: FileId) -> Option<u32> {
        self.chunks
            .iter()
            .find(|chunk| chunk.files.contains(&file))
            .map(|chunk| chunk.index)
    }
}

/// First-fit decreasing packing of `files` into chunks of at most `budget` bytes.
///
/// Files are taken largest first (ties keep input order) and dropped into the
/// first open chunk with room. A file that exceeds the budget on its own gets a
/// chunk to itself. Chunks are numbered in the order they were opened.
pub fn plan_chunks(files: &[PlanFile], budget: u64) -> ChunkPlan {
    let mut ordered: Vec<PlanFile> = files.to_vec();
    // sort_by is stable, equal sizes stay in input order
    ordered.sort_by(|a, b| b.size.cmp(&a.size));

    let mut chunks: Vec<PlannedChunk> = Vec::new();
    for file in ordered {
        let slot = if budget == 0 {
            None
        } else {
            chunks
                .iter_mut()
                .find(|chunk| chunk.total_size.saturating_add(file.size) <= budget)
        };
        match slot {
            Some(chunk) => {
                chunk.files.push(file.id);
                chunk.total_size += file.size;
            }
            None => {
                let index = chunks.len() as u32;
                chunks.push(PlannedChunk {
                    index,
                    files: vec![file.id],
                    total_size: file.size,
                });
            }
        }
    }

    ChunkPlan { budget, chunks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const GB: u64 = 1024 * 1024 * 1024;

    fn files(sizes: &[u64]) -> Vec<PlanFile> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| PlanFile {
                id: i as FileId + 1,
                size: *size,
            })
            .collect()
    }

    #[test]
    fn packs_largest_first() {
        // the 1 GB file exactly fills the first chunk, a full chunk is allowed
        let plan = plan_chunks(&files(&[GB, 3 * GB, 2 * GB]), 4 * GB);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.chunks[0].files, vec![2, 1]);
        assert_eq!(plan.chunks[0].total_size, 4 * GB);
        assert_eq!(plan.chunks[1].files, vec![3]);
        assert_eq!(plan.chunks[1].total_size, 2 * GB);
    }

    #[test]
    fn no_room_opens_a_new_chunk() {
        let plan = plan_chunks(&files(&[3 * GB, 2 * GB, GB + 1]), 4 * GB);
        let layout: Vec<Vec<FileId>> = plan.chunks.iter().map(|c| c.files.clone()).collect();
        assert_eq!(layout, vec![vec![1], vec![2, 3]]);
    }

    #[test]
    fn first_fit_revisits_earlier_chunks() {
        // 5 and 4 open two chunks, 3 fits neither, 1 slides back into the first
        let plan = plan_chunks(&files(&[5, 4, 3, 1]), 6);
        let layout: Vec<Vec<FileId>> = plan.chunks.iter().map(|c| c.files.clone()).collect();
        assert_eq!(layout, vec![vec![1, 4], vec![2], vec![3]]);
    }

    #[test]
    fn oversized_file_sits_alone() {
        let plan = plan_chunks(&files(&[10, 2, 3]), 5);
        assert_eq!(plan.chunks[0].files, vec![1]);
        assert_eq!(plan.chunks[0].total_size, 10);
        assert_eq!(plan.oversized().count(), 1);
        assert_eq!(plan.chunks[1].files, vec![3, 2]);
    }

    #[test]
    fn ties_keep_input_order() {
        let plan = plan_chunks(&files(&[2, 2, 2]), 4);
        assert_eq!(plan.chunks[0].files, vec![1, 2]);
        assert_eq!(plan.chunks[1].files, vec![3]);
    }

    #[test]
    fn empty_input_yields_empty_plan() {
        let plan = plan_chunks(&[], 4 * GB);
        assert!(plan.is_empty());
        assert_eq!(plan.total_bytes(), 0);
    }

    #[test]
    fn zero_budget_isolates_every_file() {
        let plan = plan_chunks(&files(&[0, 0, 7]), 0);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.chunk_of(3), Some(0));
    }

    #[test]
    fn plan_partitions_input_and_respects_budget() {
        // deterministic pseudo-random sizes
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for round in 0..50 {
            let count = 1 + (round % 40) as usize;
            let budget = 1_000 + (round as u64) * 37;
            let sizes: Vec<u64> = (0..count)
                .map(|_| {
                    seed = seed
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1_442_695_040_888_963_407);
                    (seed >> 33) % (budget * 3 / 2)
                })
                .collect();
            let input = files(&sizes);
            let plan = plan_chunks(&input, budget);

            let mut seen = HashSet::new();
            for (position, chunk) in plan.chunks.iter().enumerate() {
                assert_eq!(chunk.index as usize, position);
                let sum: u64 = chunk
                    .files
                    .iter()
                    .map(|id| sizes[(*id - 1) as usize])
                    .sum();
                assert_eq!(sum, chunk.total_size);
                assert!(chunk.total_size <= budget || chunk.files.len() == 1);
                for id in &chunk.files {
                    assert!(seen.insert(*id), "file {id} placed twice");
                }
            }
            assert_eq!(seen.len(), input.len());
            assert_eq!(plan.total_bytes(), sizes.iter().sum::<u64>());
        }
    }
}
