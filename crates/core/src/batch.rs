//! Multi-adapter batch descriptors.
//!
//! A [`BatchDescriptor`] is the per-step record of a heterogeneous batch:
//! padded token rows, how many tokens of each row are real, on which side
//! each row is padded, and which contiguous row ranges ([`AdapterSlice`])
//! belong to which adapter. Every routing layer of a forward pass reads the
//! same descriptor.

use candle_core::{Device, Result, Tensor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side on which a row is padded (and where generated tokens land).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

/// Contiguous, half-open row range `[start, end)` bound to one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterSlice {
    /// Registry key. A name the registry does not know means base output only.
    pub adapter_name: String,
    pub start: usize,
    pub end: usize,
}

impl AdapterSlice {
    pub fn new(adapter_name: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            start,
            end,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, row: usize) -> bool {
        self.start <= row && row < self.end
    }
}

/// Errors from descriptor validation and mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("slice {index} ({adapter}) has range [{start}, {end}) outside 0..={total_rows}")]
    SliceOutOfRange {
        index: usize,
        adapter: String,
        start: usize,
        end: usize,
        total_rows: usize,
    },

    #[error("rows {start}..{end} are not covered by any slice")]
    Gap { start: usize, end: usize },

    #[error("slice {index} ({adapter}) overlaps rows already covered up to {covered}")]
    Overlap {
        index: usize,
        adapter: String,
        covered: usize,
    },

    #[error("row {row} has {len} tokens, expected {seq_len}")]
    RaggedRow { row: usize, len: usize, seq_len: usize },

    #[error("row {row} valid length {valid} exceeds sequence length {seq_len}")]
    ValidLengthOutOfRange {
        row: usize,
        valid: usize,
        seq_len: usize,
    },

    #[error("{field} has {len} entries but the batch has {total_rows} rows")]
    MetadataLength {
        field: &'static str,
        len: usize,
        total_rows: usize,
    },

    #[error("row {row} out of range for {total_rows} rows")]
    RowOutOfRange { row: usize, total_rows: usize },

    #[error("row {row} is full ({seq_len} tokens)")]
    RowFull { row: usize, seq_len: usize },
}

/// Per-step description of a batch spanning several adapters.
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    rows: Vec<Vec<u32>>,
    valid_length: Vec<usize>,
    padding_side: Vec<PaddingSide>,
    slices: Vec<AdapterSlice>,
    prompts: Vec<Option<String>>,
    seq_len: usize,
    pad_id: u32,
    /// Report gate logits from every mixture adapter in this batch.
    pub collect_router_logits: bool,
    /// Detach outputs; no gradient-carrying state is retained.
    pub is_inference: bool,
}

impl BatchDescriptor {
    /// Build and validate a descriptor from already padded rows.
    pub fn new(
        rows: Vec<Vec<u32>>,
        valid_length: Vec<usize>,
        padding_side: Vec<PaddingSide>,
        slices: Vec<AdapterSlice>,
        pad_id: u32,
    ) -> std::result::Result<Self, BatchError> {
        let seq_len = rows.first().map_or(0, Vec::len);
        let total_rows = rows.len();
        let descriptor = Self {
            rows,
            valid_length,
            padding_side,
            slices,
            prompts: vec![None; total_rows],
            seq_len,
            pad_id,
            collect_router_logits: false,
            is_inference: false,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Descriptor carrying only row count and slices, for callers that feed
    /// hidden states directly. Rows are zero-length.
    pub fn from_slices(
        total_rows: usize,
        slices: Vec<AdapterSlice>,
    ) -> std::result::Result<Self, BatchError> {
        Self::new(
            vec![Vec::new(); total_rows],
            vec![0; total_rows],
            vec![PaddingSide::default(); total_rows],
            slices,
            0,
        )
    }

    pub fn with_router_logits(mut self, collect: bool) -> Self {
        self.collect_router_logits = collect;
        self
    }

    pub fn with_inference(mut self, is_inference: bool) -> Self {
        self.is_inference = is_inference;
        self
    }

    /// Attach raw prompts, one per row.
    pub fn with_prompts(
        mut self,
        prompts: Vec<Option<String>>,
    ) -> std::result::Result<Self, BatchError> {
        if prompts.len() != self.total_rows() {
            return Err(BatchError::MetadataLength {
                field: "prompts",
                len: prompts.len(),
                total_rows: self.total_rows(),
            });
        }
        self.prompts = prompts;
        Ok(self)
    }

    /// Check every structural invariant.
    ///
    /// Slices are checked as a set: sorted by start they must tile
    /// `[0, total_rows)` with no gap and no overlap. Their order in the
    /// descriptor is free.
    pub fn validate(&self) -> std::result::Result<(), BatchError> {
        let total_rows = self.rows.len();

        for (field, len) in [
            ("valid_length", self.valid_length.len()),
            ("padding_side", self.padding_side.len()),
            ("prompts", self.prompts.len()),
        ] {
            if len != total_rows {
                return Err(BatchError::MetadataLength {
                    field,
                    len,
                    total_rows,
                });
            }
        }

        for (row, (tokens, &valid)) in self.rows.iter().zip(&self.valid_length).enumerate() {
            if tokens.len() != self.seq_len {
                return Err(BatchError::RaggedRow {
                    row,
                    len: tokens.len(),
                    seq_len: self.seq_len,
                });
            }
            if valid > self.seq_len {
                return Err(BatchError::ValidLengthOutOfRange {
                    row,
                    valid,
                    seq_len: self.seq_len,
                });
            }
        }

        for (index, slice) in self.slices.iter().enumerate() {
            if slice.start > slice.end || slice.end > total_rows {
                return Err(BatchError::SliceOutOfRange {
                    index,
                    adapter: slice.adapter_name.clone(),
                    start: slice.start,
                    end: slice.end,
                    total_rows,
                });
            }
        }

        let mut order: Vec<usize> = (0..self.slices.len()).collect();
        order.sort_by_key(|&i| (self.slices[i].start, self.slices[i].end));
        let mut covered = 0;
        for index in order {
            let slice = &self.slices[index];
            if slice.start > covered {
                return Err(BatchError::Gap {
                    start: covered,
                    end: slice.start,
                });
            }
            if slice.start < covered && !slice.is_empty() {
                return Err(BatchError::Overlap {
                    index,
                    adapter: slice.adapter_name.clone(),
                    covered,
                });
            }
            covered = covered.max(slice.end);
        }
        if covered < total_rows {
            return Err(BatchError::Gap {
                start: covered,
                end: total_rows,
            });
        }
        Ok(())
    }

    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    pub fn valid_length(&self) -> &[usize] {
        &self.valid_length
    }

    pub fn padding_side(&self) -> &[PaddingSide] {
        &self.padding_side
    }

    pub fn slices(&self) -> &[AdapterSlice] {
        &self.slices
    }

    pub fn prompts(&self) -> &[Option<String>] {
        &self.prompts
    }

    /// The slice containing `row`, if any.
    pub fn slice_for_row(&self, row: usize) -> Option<&AdapterSlice> {
        self.slices.iter().find(|s| s.contains(row))
    }

    /// Non-padding tokens of a row, in order.
    pub fn valid_tokens(&self, row: usize) -> Option<&[u32]> {
        let tokens = self.rows.get(row)?;
        let valid = self.valid_length[row];
        Some(match self.padding_side[row] {
            PaddingSide::Right => &tokens[..valid],
            PaddingSide::Left => &tokens[self.seq_len - valid..],
        })
    }

    /// Position of a row's last real token, `None` for an empty row.
    pub fn last_position(&self, row: usize) -> Option<usize> {
        let valid = *self.valid_length.get(row)?;
        if valid == 0 {
            return None;
        }
        Some(match self.padding_side[row] {
            PaddingSide::Right => valid - 1,
            PaddingSide::Left => self.seq_len - 1,
        })
    }

    /// Whether a row has no padding left for generated tokens.
    pub fn is_row_full(&self, row: usize) -> bool {
        self.valid_length
            .get(row)
            .map_or(true, |&valid| valid >= self.seq_len)
    }

    /// Append a generated token to a row.
    ///
    /// Right-padded rows write at the first padding position; left-padded
    /// rows shift one position left and write at the end.
    pub fn append_token(&mut self, row: usize, token: u32) -> std::result::Result<(), BatchError> {
        let total_rows = self.total_rows();
        if row >= total_rows {
            return Err(BatchError::RowOutOfRange { row, total_rows });
        }
        let valid = self.valid_length[row];
        if valid >= self.seq_len {
            return Err(BatchError::RowFull {
                row,
                seq_len: self.seq_len,
            });
        }
        let tokens = &mut self.rows[row];
        match self.padding_side[row] {
            PaddingSide::Right => tokens[valid] = token,
            PaddingSide::Left => {
                tokens.rotate_left(1);
                tokens[self.seq_len - 1] = token;
            }
        }
        self.valid_length[row] += 1;
        Ok(())
    }

    /// Token ids as a `[rows, seq_len]` u32 tensor.
    pub fn token_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (self.total_rows(), self.seq_len), device)
    }

    /// `[rows, seq_len]` u8 mask: 1 on real tokens, 0 on padding.
    pub fn attention_mask(&self, device: &Device) -> Result<Tensor> {
        let mut mask = Vec::with_capacity(self.total_rows() * self.seq_len);
        for (&valid, side) in self.valid_length.iter().zip(&self.padding_side) {
            let pad = self.seq_len - valid;
            match side {
                PaddingSide::Right => {
                    mask.extend(std::iter::repeat(1u8).take(valid));
                    mask.extend(std::iter::repeat(0u8).take(pad));
                }
                PaddingSide::Left => {
                    mask.extend(std::iter::repeat(0u8).take(pad));
                    mask.extend(std::iter::repeat(1u8).take(valid));
                }
            }
        }
        Tensor::from_vec(mask, (self.total_rows(), self.seq_len), device)
    }
}

/// Assembles a descriptor from per-adapter groups of unpadded sequences.
///
/// Groups are laid out in push order, each becoming one slice. Rows are padded
/// to the longest sequence (or a fixed length) on the group's padding side;
/// longer sequences are truncated.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    pad_id: u32,
    max_seq_len: Option<usize>,
    fixed_seq_len: Option<usize>,
    groups: Vec<Group>,
    collect_router_logits: bool,
    is_inference: bool,
}

#[derive(Debug, Clone)]
struct Group {
    adapter_name: String,
    padding_side: PaddingSide,
    sequences: Vec<Vec<u32>>,
    prompts: Vec<Option<String>>,
}

impl BatchBuilder {
    pub fn new(pad_id: u32) -> Self {
        Self {
            pad_id,
            max_seq_len: None,
            fixed_seq_len: None,
            groups: Vec::new(),
            collect_router_logits: false,
            is_inference: false,
        }
    }

    /// Cap the padded length; longer sequences keep their first tokens.
    pub fn max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    /// Pad every row to exactly `seq_len`, leaving room for generated
    /// tokens. Takes precedence over [`max_seq_len`](Self::max_seq_len).
    pub fn fixed_seq_len(mut self, seq_len: usize) -> Self {
        self.fixed_seq_len = Some(seq_len);
        self
    }

    pub fn collect_router_logits(mut self, collect: bool) -> Self {
        self.collect_router_logits = collect;
        self
    }

    pub fn inference(mut self, is_inference: bool) -> Self {
        self.is_inference = is_inference;
        self
    }

    /// Add one adapter's rows as a new slice.
    pub fn push(
        &mut self,
        adapter_name: impl Into<String>,
        padding_side: PaddingSide,
        sequences: Vec<Vec<u32>>,
    ) -> &mut Self {
        let prompts = vec![None; sequences.len()];
        self.push_with_prompts(adapter_name, padding_side, sequences, prompts)
    }

    /// Like [`push`](Self::push), carrying one raw prompt per row.
    pub fn push_with_prompts(
        &mut self,
        adapter_name: impl Into<String>,
        padding_side: PaddingSide,
        sequences: Vec<Vec<u32>>,
        prompts: Vec<Option<String>>,
    ) -> &mut Self {
        self.groups.push(Group {
            adapter_name: adapter_name.into(),
            padding_side,
            sequences,
            prompts,
        });
        self
    }

    pub fn num_rows(&self) -> usize {
        self.groups.iter().map(|g| g.sequences.len()).sum()
    }

    pub fn build(self) -> std::result::Result<BatchDescriptor, BatchError> {
        let longest = self
            .groups
            .iter()
            .flat_map(|g| g.sequences.iter().map(Vec::len))
            .max()
            .unwrap_or(0);
        let seq_len = match self.fixed_seq_len {
            Some(fixed) => fixed,
            None => self.max_seq_len.map_or(longest, |cap| longest.min(cap)),
        };

        let total_rows = self.num_rows();
        let mut rows = Vec::with_capacity(total_rows);
        let mut valid_length = Vec::with_capacity(total_rows);
        let mut padding_side = Vec::with_capacity(total_rows);
        let mut prompts = Vec::with_capacity(total_rows);
        let mut slices = Vec::with_capacity(self.groups.len());

        for group in self.groups {
            if group.prompts.len() != group.sequences.len() {
                return Err(BatchError::MetadataLength {
                    field: "prompts",
                    len: group.prompts.len(),
                    total_rows: group.sequences.len(),
                });
            }
            let start = rows.len();
            for mut tokens in group.sequences {
                tokens.truncate(seq_len);
                let valid = tokens.len();
                let padding = std::iter::repeat(self.pad_id).take(seq_len - valid);
                let row: Vec<u32> = match group.padding_side {
                    PaddingSide::Right => tokens.into_iter().chain(padding).collect(),
                    PaddingSide::Left => padding.chain(tokens).collect(),
                };
                rows.push(row);
                valid_length.push(valid);
                padding_side.push(group.padding_side);
            }
            prompts.extend(group.prompts);
            slices.push(AdapterSlice::new(group.adapter_name, start, rows.len()));
        }

        let descriptor = BatchDescriptor {
            rows,
            valid_length,
            padding_side,
            slices,
            prompts,
            seq_len,
            pad_id: self.pad_id,
            collect_router_logits: self.collect_router_logits,
            is_inference: self.is_inference,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_slices() -> Vec<AdapterSlice> {
        vec![
            AdapterSlice::new("a", 0, 2),
            AdapterSlice::new("b", 2, 5),
            AdapterSlice::new("a", 5, 6),
        ]
    }

    #[test]
    fn test_from_slices_valid() {
        let batch = BatchDescriptor::from_slices(6, three_slices()).unwrap();
        assert_eq!(batch.total_rows(), 6);
        assert_eq!(batch.slices().len(), 3);
        assert_eq!(batch.slice_for_row(3).unwrap().adapter_name, "b");
        assert_eq!(batch.slice_for_row(5).unwrap().adapter_name, "a");
        assert!(batch.slice_for_row(6).is_none());
    }

    #[test]
    fn test_gap_rejected() {
        let slices = vec![AdapterSlice::new("a", 0, 2), AdapterSlice::new("b", 3, 4)];
        let err = BatchDescriptor::from_slices(4, slices).unwrap_err();
        assert_eq!(err, BatchError::Gap { start: 2, end: 3 });
    }

    #[test]
    fn test_uncovered_tail_rejected() {
        let slices = vec![AdapterSlice::new("a", 0, 2)];
        let err = BatchDescriptor::from_slices(3, slices).unwrap_err();
        assert_eq!(err, BatchError::Gap { start: 2, end: 3 });
    }

    #[test]
    fn test_overlap_rejected() {
        let slices = vec![AdapterSlice::new("a", 0, 3), AdapterSlice::new("b", 2, 4)];
        let err = BatchDescriptor::from_slices(4, slices).unwrap_err();
        assert!(matches!(err, BatchError::Overlap { index: 1, covered: 3, .. }));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let slices = vec![AdapterSlice::new("a", 0, 5)];
        let err = BatchDescriptor::from_slices(4, slices).unwrap_err();
        assert!(matches!(err, BatchError::SliceOutOfRange { end: 5, .. }));

        let slices = vec![AdapterSlice::new("a", 3, 1), AdapterSlice::new("b", 0, 4)];
        assert!(BatchDescriptor::from_slices(4, slices).is_err());
    }

    #[test]
    fn test_empty_slice_is_legal() {
        let slices = vec![
            AdapterSlice::new("a", 0, 2),
            AdapterSlice::new("empty", 2, 2),
            AdapterSlice::new("b", 2, 3),
        ];
        assert!(BatchDescriptor::from_slices(3, slices).is_ok());
    }

    #[test]
    fn test_permuted_slices_are_valid() {
        let mut slices = three_slices();
        slices.reverse();
        assert!(BatchDescriptor::from_slices(6, slices).is_ok());
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let err = BatchDescriptor::new(
            vec![vec![1, 2, 3], vec![1, 2]],
            vec![3, 2],
            vec![PaddingSide::Right; 2],
            vec![AdapterSlice::new("a", 0, 2)],
            0,
        )
        .unwrap_err();
        assert_eq!(
            err,
            BatchError::RaggedRow {
                row: 1,
                len: 2,
                seq_len: 3
            }
        );
    }

    #[test]
    fn test_metadata_length_rejected() {
        let err = BatchDescriptor::new(
            vec![vec![1, 2], vec![3, 4]],
            vec![2],
            vec![PaddingSide::Right; 2],
            vec![AdapterSlice::new("a", 0, 2)],
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BatchError::MetadataLength { field: "valid_length", .. }));
    }

    #[test]
    fn test_builder_pads_per_side() {
        let mut builder = BatchBuilder::new(0);
        builder
            .push("left", PaddingSide::Left, vec![vec![5, 6], vec![7]])
            .push("right", PaddingSide::Right, vec![vec![1, 2, 3]]);
        let batch = builder.build().unwrap();

        assert_eq!(batch.seq_len(), 3);
        assert_eq!(batch.rows(), &[vec![0u32, 5, 6], vec![0, 0, 7], vec![1, 2, 3]]);
        assert_eq!(batch.valid_length(), &[2, 1, 3]);
        assert_eq!(
            batch.slices(),
            &[AdapterSlice::new("left", 0, 2), AdapterSlice::new("right", 2, 3)]
        );
        assert_eq!(batch.valid_tokens(1).unwrap(), &[7]);
    }

    #[test]
    fn test_builder_truncates() {
        let mut builder = BatchBuilder::new(9).max_seq_len(2);
        builder.push("a", PaddingSide::Right, vec![vec![1, 2, 3, 4], vec![5]]);
        let batch = builder.build().unwrap();
        assert_eq!(batch.rows(), &[vec![1u32, 2], vec![5, 9]]);
        assert_eq!(batch.valid_length(), &[2, 1]);
    }

    #[test]
    fn test_builder_fixed_seq_len_leaves_room() {
        let mut builder = BatchBuilder::new(0).max_seq_len(2).fixed_seq_len(4);
        builder
            .push("r", PaddingSide::Right, vec![vec![1, 2]])
            .push("l", PaddingSide::Left, vec![vec![3], vec![4, 5, 6, 7, 8]]);
        let batch = builder.build().unwrap();

        assert_eq!(batch.seq_len(), 4);
        assert_eq!(batch.rows(), &[vec![1u32, 2, 0, 0], vec![0, 0, 0, 3], vec![4, 5, 6, 7]]);
        assert_eq!(batch.last_position(0), Some(1));
        assert_eq!(batch.last_position(1), Some(3));
        assert!(!batch.is_row_full(0));
        assert!(batch.is_row_full(2));
        assert!(batch.is_row_full(3));
    }

    #[test]
    fn test_last_position_of_empty_row() {
        let batch = BatchDescriptor::from_slices(1, vec![AdapterSlice::new("a", 0, 1)]).unwrap();
        assert_eq!(batch.last_position(0), None);
        assert_eq!(batch.last_position(1), None);
    }

    #[test]
    fn test_append_token_right() {
        let mut builder = BatchBuilder::new(0);
        builder.push("a", PaddingSide::Right, vec![vec![1, 2, 3], vec![4]]);
        let mut batch = builder.build().unwrap();

        batch.append_token(1, 8).unwrap();
        assert_eq!(batch.rows()[1], vec![4u32, 8, 0]);
        assert_eq!(batch.valid_length()[1], 2);

        let err = batch.append_token(0, 8).unwrap_err();
        assert_eq!(err, BatchError::RowFull { row: 0, seq_len: 3 });
        assert!(matches!(
            batch.append_token(2, 1),
            Err(BatchError::RowOutOfRange { row: 2, .. })
        ));
    }

    #[test]
    fn test_append_token_left() {
        let mut builder = BatchBuilder::new(0);
        builder.push("a", PaddingSide::Left, vec![vec![1, 2, 3], vec![4]]);
        let mut batch = builder.build().unwrap();
        assert_eq!(batch.rows()[1], vec![0u32, 0, 4]);

        batch.append_token(1, 8).unwrap();
        assert_eq!(batch.rows()[1], vec![0u32, 4, 8]);
        assert_eq!(batch.valid_tokens(1).unwrap(), &[4, 8]);
    }

    #[test]
    fn test_attention_mask_and_tokens() {
        let device = Device::Cpu;
        let mut builder = BatchBuilder::new(0);
        builder
            .push("l", PaddingSide::Left, vec![vec![3]])
            .push("r", PaddingSide::Right, vec![vec![4, 5]]);
        let batch = builder.build().unwrap();

        let mask: Vec<Vec<u8>> = batch.attention_mask(&device).unwrap().to_vec2().unwrap();
        assert_eq!(mask, vec![vec![0, 1], vec![1, 1]]);

        let tokens: Vec<Vec<u32>> = batch.token_tensor(&device).unwrap().to_vec2().unwrap();
        assert_eq!(tokens, vec![vec![0, 3], vec![4, 5]]);
    }

    #[test]
    fn test_prompts() {
        let mut builder = BatchBuilder::new(0).collect_router_logits(true);
        builder.push_with_prompts(
            "a",
            PaddingSide::Right,
            vec![vec![1]],
            vec![Some("hello".to_string())],
        );
        let batch = builder.build().unwrap();
        assert!(batch.collect_router_logits);
        assert_eq!(batch.prompts()[0].as_deref(), Some("hello"));

        assert!(batch.clone().with_prompts(vec![]).is_err());
    }
}
