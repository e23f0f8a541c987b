//! CLI command implementations

pub mod browse;
pub mod config;
pub mod delete;
pub mod fetch;
pub mod gc;
pub mod invalidate;
pub mod rebuild;
pub mod repos;

pub use browse::execute as browse;
pub use config::execute as config;
pub use delete::execute as delete;
pub use fetch::execute as fetch;
pub use gc::execute as gc;
pub use invalidate::execute as invalidate;
pub use rebuild::execute as rebuild;
pub use repos::execute as repos;

use crate::context::RequestContext;

/// Request context for an operator command; Ctrl-C cancels it
pub(crate) fn operator_context() -> RequestContext {
    let client = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
    let ctx = RequestContext::new().with_client(format!("cli:{}", client));

    let cancel = ctx.cancellation().clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {}
        }
    });

    ctx
}
