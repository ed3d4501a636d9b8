//! The user-supplied per-block mapping function contract.

use async_trait::async_trait;

use crate::error::MapError;
use crate::source::{HasHeader, PerBlockOutput};

/// Maps one block to a per-table row set. Implementations must be pure with
/// respect to the block (two calls on equal blocks produce equal output) and
/// must not retain references to mutable parts of the block after returning.
#[async_trait]
pub trait Mapper<B>: Send + Sync
where
    B: HasHeader + Send + Sync,
{
    async fn map(&self, block: &B) -> Result<PerBlockOutput, MapError>;
}

/// Adapts a plain closure returning a `Future` into a [`Mapper`], for
/// pipelines that don't need any mapper-local state.
pub struct FnMapper<F>(pub F);

#[async_trait]
impl<B, F, Fut> Mapper<B> for FnMapper<F>
where
    B: HasHeader + Send + Sync,
    F: Fn(&B) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<PerBlockOutput, MapError>> + Send,
{
    async fn map(&self, block: &B) -> Result<PerBlockOutput, MapError> {
        (self.0)(block).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BlockHeader;

    struct Block(BlockHeader);

    impl HasHeader for Block {
        fn header(&self) -> &BlockHeader {
            &self.0
        }
    }

    #[tokio::test]
    async fn fn_mapper_delegates_to_the_closure() {
        let mapper = FnMapper(|block: &Block| {
            let number = block.0.number;
            async move {
                let mut output = PerBlockOutput::new();
                output.push("t", serde_json::json!({ "n": number }).as_object().unwrap().clone());
                Ok(output)
            }
        });

        let block = Block(BlockHeader { number: 7, hash: "h".into(), parent_hash: String::new(), parent_number: None, timestamp: None });
        let output = mapper.map(&block).await.unwrap();
        assert_eq!(output.tables["t"].len(), 1);
        assert_eq!(output.tables["t"][0]["n"], 7);
    }
}
