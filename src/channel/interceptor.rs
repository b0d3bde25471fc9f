//! Interceptor pipelines.
//!
//! Three registration scopes compose in order: global, per-service,
//! per-method. The chain is built per call by folding the interceptor list
//! into nested continuations, so there is no shared mutable cursor; each
//! interceptor receives the call and the continuation and must invoke the
//! continuation exactly once unless it synthesizes a result.

use crate::channel::{Reply, Rpc};
use crate::error::{CallError, RpcError};
use futures::future::BoxFuture;
use std::sync::Arc;

/// The continuation an interceptor drives.
pub type OutgoingNext = Box<dyn FnOnce(Rpc) -> BoxFuture<'static, Result<Reply, CallError>> + Send>;

/// Wraps an outgoing call. Runs on the sender before marshaling.
pub type OutgoingInterceptor =
    Arc<dyn Fn(Rpc, OutgoingNext) -> BoxFuture<'static, Result<Reply, CallError>> + Send + Sync>;

pub type IncomingNext = Box<dyn FnOnce(Rpc) -> BoxFuture<'static, Result<Reply, RpcError>> + Send>;

/// Wraps an incoming request. Runs on the receiver before the handler.
pub type IncomingInterceptor =
    Arc<dyn Fn(Rpc, IncomingNext) -> BoxFuture<'static, Result<Reply, RpcError>> + Send + Sync>;

/// The registered service handler, the innermost frame of the incoming
/// pipeline.
pub type ServiceHandler = Arc<dyn Fn(Rpc) -> BoxFuture<'static, Result<Reply, RpcError>> + Send + Sync>;

pub(crate) fn compose_outgoing(
    list: Vec<OutgoingInterceptor>,
    terminal: OutgoingNext,
) -> OutgoingNext {
    list.into_iter()
        .rev()
        .fold(terminal, |next, interceptor| Box::new(move |rpc| interceptor(rpc, next)))
}

pub(crate) fn compose_incoming(
    list: Vec<IncomingInterceptor>,
    terminal: IncomingNext,
) -> IncomingNext {
    list.into_iter()
        .rev()
        .fold(terminal, |next, interceptor| Box::new(move |rpc| interceptor(rpc, next)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CallVars;
    use crate::message::NullMessage;
    use crate::wire::ExtraData;
    use std::sync::Mutex;

    fn test_rpc() -> Rpc {
        Rpc {
            vars: CallVars::root(None, "svc", "m", 0, ""),
            extra_data: ExtraData::default(),
            request: Box::new(NullMessage),
            deadline: None,
        }
    }

    fn tagging(order: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> OutgoingInterceptor {
        Arc::new(move |rpc, next| {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push(tag);
                next(rpc).await
            })
        })
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let list = vec![
            tagging(order.clone(), "global"),
            tagging(order.clone(), "service"),
            tagging(order.clone(), "method"),
        ];
        let terminal_order = order.clone();
        let terminal: OutgoingNext = Box::new(move |_rpc| {
            Box::pin(async move {
                terminal_order.lock().unwrap().push("terminal");
                Ok(Reply::new(Box::new(NullMessage)))
            })
        });
        compose_outgoing(list, terminal)(test_rpc()).await.expect("chain");
        assert_eq!(*order.lock().unwrap(), vec!["global", "service", "method", "terminal"]);
    }

    #[tokio::test]
    async fn test_interceptor_can_synthesize() {
        let short_circuit: OutgoingInterceptor = Arc::new(|_rpc, _next| {
            Box::pin(async move { Err(CallError::Closed) })
        });
        let unreachable: OutgoingNext =
            Box::new(|_rpc| Box::pin(async move { panic!("continuation must not run") }));
        let r = compose_outgoing(vec![short_circuit], unreachable)(test_rpc()).await;
        assert!(matches!(r, Err(CallError::Closed)));
    }
}
