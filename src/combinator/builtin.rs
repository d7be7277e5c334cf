//! Built-in combinators

use std::fmt::Debug;
use std::ops::Add;

use super::{Combinator, MergeRefused};

/// The newer value replaces the older one
#[derive(Debug, Clone, Copy, Default)]
pub struct OverwriteCombinator;

impl<T: Clone> Combinator<T> for OverwriteCombinator
where
    T: Send + Sync,
{
    fn combine(&self, _first: &T, second: &T) -> Result<T, MergeRefused> {
        Ok(second.clone())
    }
}

/// Counters: values are added together
#[derive(Debug, Clone, Copy, Default)]
pub struct SumCombinator;

impl<T> Combinator<T> for SumCombinator
where
    T: Copy + Add<Output = T> + Send + Sync,
{
    fn combine(&self, first: &T, second: &T) -> Result<T, MergeRefused> {
        Ok(*first + *second)
    }
}

/// Keeps the larger value
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxCombinator;

impl<T> Combinator<T> for MaxCombinator
where
    T: Ord + Clone + Send + Sync,
{
    fn combine(&self, first: &T, second: &T) -> Result<T, MergeRefused> {
        Ok(if second > first {
            second.clone()
        } else {
            first.clone()
        })
    }
}

/// Every key maps to exactly one value: rewriting the same value is fine,
/// a different value is a conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueCombinator;

impl<T> Combinator<T> for UniqueCombinator
where
    T: PartialEq + Debug + Clone + Send + Sync,
{
    fn combine(&self, first: &T, second: &T) -> Result<T, MergeRefused> {
        if first == second {
            Ok(first.clone())
        } else {
            Err(MergeRefused::new(format!(
                "value must be unique, found {:?} and {:?}",
                first, second
            )))
        }
    }
}

/// Union of two lists, keeping first-seen order and dropping duplicates
/// coming from the newer list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListUnionCombinator;

impl<E> Combinator<Vec<E>> for ListUnionCombinator
where
    E: PartialEq + Clone + Send + Sync,
{
    fn combine(&self, first: &Vec<E>, second: &Vec<E>) -> Result<Vec<E>, MergeRefused> {
        let mut merged = first.clone();
        for item in second {
            if !merged.contains(item) {
                merged.push(item.clone());
            }
        }
        Ok(merged)
    }
}
