#![allow(dead_code)]

use captains_log::*;
use rstest::fixture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tandem_rpc::net::TcpAcceptor;
use tandem_rpc::{
    new_raw_message, CallError, CallOptions, Channel, ChannelError, ChannelOptions, ClientChannel,
    ClientChannelOptions, Message, RawMessage, Reply, ServiceHandler,
};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

pub struct TestRunner {
    rt: Runtime,
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/tandem_rpc_test.log", Level::Trace)
            .test()
            .build()
            .expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(8)
                .enable_all()
                .build()
                .expect("runtime"),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

/// Called once per accepted connection with its index and server channel.
pub type ConnHook = Arc<dyn Fn(usize, Channel) + Send + Sync>;

pub struct TestServer {
    pub addr: String,
    accept_task: JoinHandle<()>,
    channels: Arc<Mutex<Vec<Channel>>>,
}

/// Binds an ephemeral port and serves every accepted connection on a fresh
/// server channel built from `options`.
pub fn start_server(options: ChannelOptions, on_conn: Option<ConnHook>) -> TestServer {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").expect("bind");
    let addr = acceptor.local_addr().to_string();
    let channels: Arc<Mutex<Vec<Channel>>> = Arc::new(Mutex::new(Vec::new()));
    let channels2 = channels.clone();
    let accept_task = tokio::spawn(async move {
        let mut index = 0usize;
        loop {
            match acceptor.accept().await {
                Ok(conn) => {
                    let channel = Channel::server(options.clone());
                    channels2.lock().unwrap().push(channel.clone());
                    if let Some(hook) = on_conn.as_ref() {
                        hook(index, channel.clone());
                    }
                    index += 1;
                    tokio::spawn(async move {
                        let _ = channel.serve(conn).await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    TestServer { addr, accept_task, channels }
}

impl TestServer {
    pub fn stop(&self) {
        self.accept_task.abort();
        for channel in self.channels.lock().unwrap().iter() {
            channel.close();
        }
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.lock().unwrap().clone()
    }
}

pub fn start_client(
    options: ClientChannelOptions,
    addr: &str,
) -> (
    Arc<ClientChannel<tandem_rpc::net::TcpConnector>>,
    JoinHandle<Result<(), ChannelError>>,
) {
    let client = Arc::new(ClientChannel::new(
        options,
        tandem_rpc::net::TcpConnector,
        &[addr.to_string()],
    ));
    let runner = client.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    (client, handle)
}

/// A handler that answers `return <tag>(<request>)`, the ping-pong shape.
pub fn echo_handler(tag: &'static str) -> ServiceHandler {
    Arc::new(move |rpc| {
        Box::pin(async move {
            let req = rpc
                .request
                .as_any()
                .downcast_ref::<RawMessage>()
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Ok(Reply::new(Box::new(RawMessage::from_str(&format!("return {}({})", tag, req)))))
        })
    })
}

pub async fn echo_call(
    channel: &Channel,
    service: &str,
    method: &str,
    text: &str,
) -> Result<String, CallError> {
    let reply = channel
        .call(
            CallOptions::new(service, method),
            Box::new(RawMessage::from_str(text)),
            new_raw_message(),
        )
        .await?;
    Ok(reply.downcast_ref::<RawMessage>().map(|m| m.as_str().to_string()).unwrap_or_default())
}
