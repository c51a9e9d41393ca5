//! Reduction strategies.
//!
//! A strategy supplies the three reduction steps the engine runs: a chunk
//! partial in Stage 1, combining the chunk partials of one segment, and the
//! final merge of a tensor's partials in Stage 2. The reference strategies
//! accumulate in f64 and emit f32.

use std::fmt::Debug;
use std::str::FromStr;

/// One buffer's worth of widened input handed to a strategy.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// Index of the tensor the chunk belongs to.
    pub tensor: usize,
    /// Element offset of `data[0]` inside the tensor.
    pub offset: u64,
    pub data: &'a [f32],
}

/// Trait for pluggable reductions.
///
/// `combine_partials` must be associative over partials given in element
/// order; the engine always presents them in that order.
pub trait ReduceStrategy: Send + Sync {
    type Partial: Copy + Send + Sync + Debug;
    type Output: Copy + Send + Sync + Debug;

    fn name(&self) -> &'static str;

    /// Output for a tensor with zero elements.
    fn identity(&self) -> Self::Output;

    /// Reduce one chunk of input.
    fn compute_partial(&self, chunk: Chunk<'_>) -> Self::Partial;

    /// Fold partials, given in element order, into one.
    fn combine_partials(&self, partials: &[Self::Partial]) -> Self::Partial;

    /// Turn a fully combined partial into the tensor's output.
    fn finalize(&self, merged: Self::Partial) -> Self::Output;

    /// Stage 2 merge of one tensor's partials.
    fn merge_partials(&self, partials: &[Self::Partial]) -> Self::Output {
        self.finalize(self.combine_partials(partials))
    }

    /// Called once per worker before Stage 1.
    fn before_all(&self, _worker: usize) {}

    /// Called once per worker after Stage 1.
    fn after_all(&self, _worker: usize) {}
}

/// Type-erased f32-output strategy, as built by [`StrategyKind`].
pub type BoxedStrategy = Box<dyn ReduceStrategy<Partial = f64, Output = f32>>;

fn sum_f64(partials: &[f64]) -> f64 {
    partials.iter().sum()
}

fn max_f64(partials: &[f64], init: f64) -> f64 {
    partials.iter().copied().fold(init, f64::max)
}

fn min_f64(partials: &[f64], init: f64) -> f64 {
    partials.iter().copied().fold(init, f64::min)
}

/// Σx
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl ReduceStrategy for Sum {
    type Partial = f64;
    type Output = f32;

    fn name(&self) -> &'static str {
        "sum"
    }

    fn identity(&self) -> f32 {
        0.0
    }

    fn compute_partial(&self, chunk: Chunk<'_>) -> f64 {
        chunk.data.iter().map(|&x| x as f64).sum()
    }

    fn combine_partials(&self, partials: &[f64]) -> f64 {
        sum_f64(partials)
    }

    fn finalize(&self, merged: f64) -> f32 {
        merged as f32
    }
}

/// Largest element. NaN elements are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl ReduceStrategy for Max {
    type Partial = f64;
    type Output = f32;

    fn name(&self) -> &'static str {
        "max"
    }

    fn identity(&self) -> f32 {
        f32::NEG_INFINITY
    }

    fn compute_partial(&self, chunk: Chunk<'_>) -> f64 {
        chunk
            .data
            .iter()
            .fold(f64::NEG_INFINITY, |acc, &x| acc.max(x as f64))
    }

    fn combine_partials(&self, partials: &[f64]) -> f64 {
        max_f64(partials, f64::NEG_INFINITY)
    }

    fn finalize(&self, merged: f64) -> f32 {
        merged as f32
    }
}

/// Smallest element. NaN elements are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl ReduceStrategy for Min {
    type Partial = f64;
    type Output = f32;

    fn name(&self) -> &'static str {
        "min"
    }

    fn identity(&self) -> f32 {
        f32::INFINITY
    }

    fn compute_partial(&self, chunk: Chunk<'_>) -> f64 {
        chunk
            .data
            .iter()
            .fold(f64::INFINITY, |acc, &x| acc.min(x as f64))
    }

    fn combine_partials(&self, partials: &[f64]) -> f64 {
        min_f64(partials, f64::INFINITY)
    }

    fn finalize(&self, merged: f64) -> f32 {
        merged as f32
    }
}

/// Σ|x|
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Norm;

impl ReduceStrategy for L1Norm {
    type Partial = f64;
    type Output = f32;

    fn name(&self) -> &'static str {
        "l1"
    }

    fn identity(&self) -> f32 {
        0.0
    }

    fn compute_partial(&self, chunk: Chunk<'_>) -> f64 {
        chunk.data.iter().map(|&x| (x as f64).abs()).sum()
    }

    fn combine_partials(&self, partials: &[f64]) -> f64 {
        sum_f64(partials)
    }

    fn finalize(&self, merged: f64) -> f32 {
        merged as f32
    }
}

/// √Σx²
///
/// Partials carry the sum of squares; the root is taken once per tensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Norm;

impl ReduceStrategy for L2Norm {
    type Partial = f64;
    type Output = f32;

    fn name(&self) -> &'static str {
        "l2"
    }

    fn identity(&self) -> f32 {
        0.0
    }

    fn compute_partial(&self, chunk: Chunk<'_>) -> f64 {
        chunk
            .data
            .iter()
            .map(|&x| {
                let x = x as f64;
                x * x
            })
            .sum()
    }

    fn combine_partials(&self, partials: &[f64]) -> f64 {
        sum_f64(partials)
    }

    fn finalize(&self, merged: f64) -> f32 {
        merged.sqrt() as f32
    }
}

/// max |x|
#[derive(Debug, Clone, Copy, Default)]
pub struct InfNorm;

impl ReduceStrategy for InfNorm {
    type Partial = f64;
    type Output = f32;

    fn name(&self) -> &'static str {
        "inf"
    }

    fn identity(&self) -> f32 {
        0.0
    }

    fn compute_partial(&self, chunk: Chunk<'_>) -> f64 {
        chunk
            .data
            .iter()
            .fold(0.0f64, |acc, &x| acc.max((x as f64).abs()))
    }

    fn combine_partials(&self, partials: &[f64]) -> f64 {
        max_f64(partials, 0.0)
    }

    fn finalize(&self, merged: f64) -> f32 {
        merged as f32
    }
}

/// Position and value of a tensor's largest element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgMaxHit {
    pub value: f32,
    /// Flat element index inside the tensor.
    pub index: u64,
}

/// Largest element and its index. Ties go to the first occurrence; NaN
/// elements are ignored; a tensor without candidates yields `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgMax;

impl ArgMax {
    fn better(best: Option<ArgMaxHit>, candidate: ArgMaxHit) -> bool {
        match best {
            None => true,
            Some(b) => candidate.value > b.value,
        }
    }
}

impl ReduceStrategy for ArgMax {
    type Partial = Option<ArgMaxHit>;
    type Output = Option<ArgMaxHit>;

    fn name(&self) -> &'static str {
        "argmax"
    }

    fn identity(&self) -> Option<ArgMaxHit> {
        None
    }

    fn compute_partial(&self, chunk: Chunk<'_>) -> Option<ArgMaxHit> {
        let mut best = None;
        for (i, &value) in chunk.data.iter().enumerate() {
            if value.is_nan() {
                continue;
            }
            let hit = ArgMaxHit {
                value,
                index: chunk.offset + i as u64,
            };
            if Self::better(best, hit) {
                best = Some(hit);
            }
        }
        best
    }

    fn combine_partials(&self, partials: &[Option<ArgMaxHit>]) -> Option<ArgMaxHit> {
        let mut best = None;
        for hit in partials.iter().flatten() {
            if Self::better(best, *hit) {
                best = Some(*hit);
            }
        }
        best
    }

    fn finalize(&self, merged: Option<ArgMaxHit>) -> Option<ArgMaxHit> {
        merged
    }
}

/// Named f32-output strategies, selectable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Sum,
    Max,
    Min,
    L1,
    L2,
    Inf,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Sum,
        StrategyKind::Max,
        StrategyKind::Min,
        StrategyKind::L1,
        StrategyKind::L2,
        StrategyKind::Inf,
    ];

    pub fn build(self) -> BoxedStrategy {
        match self {
            StrategyKind::Sum => Box::new(Sum),
            StrategyKind::Max => Box::new(Max),
            StrategyKind::Min => Box::new(Min),
            StrategyKind::L1 => Box::new(L1Norm),
            StrategyKind::L2 => Box::new(L2Norm),
            StrategyKind::Inf => Box::new(InfNorm),
        }
    }

    pub fn name(self) -> &'static str {
        self.build().name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown strategy '{0}' (expected sum, max, min, l1, l2 or inf)")]
pub struct UnknownStrategy(pub String);

impl FromStr for StrategyKind {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(StrategyKind::Sum),
            "max" => Ok(StrategyKind::Max),
            "min" => Ok(StrategyKind::Min),
            "l1" | "l1norm" => Ok(StrategyKind::L1),
            "l2" | "l2norm" | "norm" => Ok(StrategyKind::L2),
            "inf" | "linf" | "infnorm" => Ok(StrategyKind::Inf),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &[f32]) -> Chunk<'_> {
        Chunk {
            tensor: 0,
            offset: 0,
            data,
        }
    }

    #[test]
    fn test_norms() {
        let data = [3.0, -4.0];
        assert_eq!(L1Norm.merge_partials(&[L1Norm.compute_partial(chunk(&data))]), 7.0);
        assert_eq!(L2Norm.merge_partials(&[L2Norm.compute_partial(chunk(&data))]), 5.0);
        assert_eq!(InfNorm.merge_partials(&[InfNorm.compute_partial(chunk(&data))]), 4.0);
    }

    #[test]
    fn test_l2_roots_once() {
        // Partials are squared sums; merging must not root them individually.
        let a = L2Norm.compute_partial(chunk(&[3.0]));
        let b = L2Norm.compute_partial(chunk(&[4.0]));
        assert_eq!(L2Norm.merge_partials(&[a, b]), 5.0);
    }

    #[test]
    fn test_max_min_ignore_nan() {
        let data = [1.0, f32::NAN, -2.0];
        assert_eq!(Max.finalize(Max.compute_partial(chunk(&data))), 1.0);
        assert_eq!(Min.finalize(Min.compute_partial(chunk(&data))), -2.0);
        assert_eq!(Max.identity(), f32::NEG_INFINITY);
        assert_eq!(Min.identity(), f32::INFINITY);
    }

    #[test]
    fn test_argmax_first_occurrence() {
        let first = ArgMax.compute_partial(Chunk {
            tensor: 0,
            offset: 8,
            data: &[1.0, 9.0, 9.0],
        });
        assert_eq!(first, Some(ArgMaxHit { value: 9.0, index: 9 }));

        let later = Some(ArgMaxHit { value: 9.0, index: 40 });
        assert_eq!(ArgMax.merge_partials(&[first, None, later]), first);
        assert_eq!(ArgMax.merge_partials(&[]), None);
        assert_eq!(ArgMax.compute_partial(chunk(&[f32::NAN])), None);
    }

    #[test]
    fn test_kind_parsing() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.name().parse::<StrategyKind>(), Ok(kind));
        }
        assert_eq!("L2".parse::<StrategyKind>(), Ok(StrategyKind::L2));
        assert!("mean".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_boxed_dispatch() {
        let s = StrategyKind::Sum.build();
        let p = s.compute_partial(chunk(&[1.0, 2.0, 3.5]));
        assert_eq!(s.merge_partials(&[p, p]), 13.0);
        assert_eq!(s.identity(), 0.0);
    }
}
