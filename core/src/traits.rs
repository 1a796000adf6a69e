//! Core traits for records and the functions mapped over them.

use crate::task::TaskContext;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// A data type that can be stored in a partitioned dataset or broadcast.
pub trait Data: Send + Sync + Clone + Debug + Serialize + DeserializeOwned + 'static {}
impl<T> Data for T where T: Send + Sync + Clone + Debug + Serialize + DeserializeOwned + 'static {}

/// A function that can be mapped over a partitioned dataset.
///
/// Functions are not shipped as code. Every process registers the same set of
/// functions under their [`NAME`](TaskFunction::NAME); a task carries the name
/// plus the serialized struct, whose fields are the function's arguments
/// (broadcast handles included).
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct AddNoise { noise: BroadcastHandle<Vec<f64>> }
///
/// impl TaskFunction for AddNoise {
///     const NAME: &'static str = "add_noise";
///     type Input = f64;
///     type Output = f64;
///
///     fn call(&self, index: usize, x: f64, ctx: &TaskContext) -> anyhow::Result<f64> {
///         Ok(x + ctx.value(&self.noise)?[index])
///     }
/// }
/// ```
pub trait TaskFunction: Serialize + DeserializeOwned + Send + Sync + Debug + 'static {
    /// Registered name, identical on every process.
    const NAME: &'static str;

    type Input: Data;
    type Output: Data;

    /// Compute the output for the record at global `index`.
    fn call(
        &self,
        index: usize,
        input: Self::Input,
        ctx: &TaskContext,
    ) -> anyhow::Result<Self::Output>;
}
