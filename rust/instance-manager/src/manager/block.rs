//! nginx configuration fragments inserted at well-known scopes

use serde::Serialize;
use snafu::{ensure, ResultExt, Snafu};

use super::{namespace_of, GetInstanceError, InstanceManager};
use crate::{
    crd::{BlockType, RpaasInstance, Value},
    error::{ErrorKind, ManagerError},
    gateway::{self, value, Gateway},
    validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("block type {block_type:?} is not allowed"))]
    InvalidBlockType {
        source: strum::ParseError,
        block_type: String,
    },

    #[snafu(display("invalid block content"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("block {block_type:?} not found"))]
    NotFound { block_type: BlockType },

    #[snafu(display("failed to read block {block_type:?}"))]
    ResolveValue {
        source: value::Error,
        block_type: BlockType,
    },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidBlockType { .. } | Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::ResolveValue { source, .. } => source.kind(),
            Error::PatchInstance { source } => source.kind(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Block {
    pub name: BlockType,
    pub content: String,
}

fn parse_block_type(block_type: &str) -> Result<BlockType, Error> {
    block_type
        .parse()
        .context(error::InvalidBlockTypeSnafu { block_type })
}

impl<G: Gateway> InstanceManager<G> {
    pub async fn update_block(
        &self,
        name: &str,
        block_type: &str,
        content: &str,
    ) -> Result<(), Error> {
        let opts = self.options();
        let block_type = parse_block_type(block_type)?;
        validation::content(content, &opts.config_deny_patterns)
            .context(error::ValidationSnafu)?;

        let original = self
            .find_instance(&opts, name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        target
            .spec
            .blocks
            .insert(block_type, Value::Inline(content.to_string()));
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn delete_block(&self, name: &str, block_type: &str) -> Result<(), Error> {
        let block_type = parse_block_type(block_type)?;
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        ensure!(
            target.spec.blocks.remove(&block_type).is_some(),
            error::NotFoundSnafu { block_type }
        );
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// Blocks with their content resolved, sorted by name
    pub async fn list_blocks(&self, name: &str) -> Result<Vec<Block>, Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        self.resolve_blocks(&instance).await
    }

    pub(super) async fn resolve_blocks(
        &self,
        instance: &RpaasInstance,
    ) -> Result<Vec<Block>, Error> {
        let namespace = namespace_of(instance);
        let mut blocks = Vec::with_capacity(instance.spec.blocks.len());
        for (block_type, block_value) in &instance.spec.blocks {
            let content = value::resolve(&self.client, &namespace, block_value)
                .await
                .context(error::ResolveValueSnafu {
                    block_type: *block_type,
                })?;
            if let Some(content) = content {
                blocks.push(Block {
                    name: *block_type,
                    content,
                });
            }
        }
        blocks.sort_by_key(|block| block.name.to_string());
        Ok(blocks)
    }
}
