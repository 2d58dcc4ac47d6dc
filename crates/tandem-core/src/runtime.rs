//! Process-wide state fixed once at startup

use once_cell::sync::OnceCell;
use tracing::info;

use crate::{transport::PRIMARY_RANK, CoreError, Result};

static CONTEXT: OnceCell<ProcessContext> = OnceCell::new();

/// Identity and shared seed of the current process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    pub rank: usize,
    pub world_size: usize,
    pub seed: u64,
}

impl ProcessContext {
    pub fn is_primary(&self) -> bool {
        self.rank == PRIMARY_RANK
    }
}

/// Record the process context. Must run before any request is served.
///
/// Calling it again with the same values is a no-op; different values are
/// rejected because the seed and rank may not change while serving.
pub fn init(context: ProcessContext) -> Result<&'static ProcessContext> {
    let stored = CONTEXT.get_or_init(|| {
        info!(
            rank = context.rank,
            world_size = context.world_size,
            seed = context.seed,
            "Process context initialised"
        );
        context
    });

    if *stored != context {
        return Err(CoreError::configuration(
            "CONFIG_REINIT",
            format!("process context already initialised as {stored:?}"),
            "runtime::init",
            "Initialise the process context exactly once at startup",
        ));
    }
    Ok(stored)
}

/// The context recorded by [`init`], if any
pub fn context() -> Option<&'static ProcessContext> {
    CONTEXT.get()
}

/// Whether this process is the primary; false before [`init`]
pub fn is_primary() -> bool {
    context().map(ProcessContext::is_primary).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_rejects_changes() {
        let ctx = ProcessContext {
            rank: 0,
            world_size: 2,
            seed: 1,
        };
        let stored = init(ctx).unwrap();
        assert_eq!(*stored, ctx);
        assert!(init(ctx).is_ok());
        assert!(is_primary());
        assert_eq!(context(), Some(&ctx));

        let err = init(ProcessContext { seed: 7, ..ctx }).unwrap_err();
        assert_eq!(err.code(), "CONFIG_REINIT");
    }
}
