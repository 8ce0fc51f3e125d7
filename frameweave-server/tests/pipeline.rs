// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! End-to-end frame-pipeline scenarios over real loopback sockets:
//! the server drives in-process render clients through init, frames
//! and exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frameweave::channel::{ChannelHandler, ChannelView};
use frameweave::client::{Client, ClientOptions, NodeFactory};
use frameweave::node::NodeHandler;
use frameweave::pipe::PipeHandler;
use frameweave::types::{Range, ThreadModel, Viewport};
use frameweave::window::WindowHandler;
use frameweave::window_system::{HeadlessWindow, SystemWindow};
use frameweave::ClientResult;
use frameweave_net::connection::ConnectionDescription;
use frameweave_net::node::ListenOptions;
use frameweave_server::compound::Compound;
use frameweave_server::server::Server;
use frameweave_server::spec::{ChannelSpec, ConfigSpec, NodeSpec, PipeSpec, WindowSpec};
use frameweave_server::ServerError;

const DEADLINE: Duration = Duration::from_secs(10);

/// Observable render activity shared between the test and its client
#[derive(Default)]
struct Activity {
    draws: AtomicU64,
    swaps: AtomicU64,
    assembled: AtomicU64,
    draw_delay_ms: AtomicU64,
}

struct CountingFactory {
    activity: Arc<Activity>,
}

struct CountingChannel {
    activity: Arc<Activity>,
}

impl ChannelHandler for CountingChannel {
    fn frame_draw(&mut self, view: &mut ChannelView<'_>) -> ClientResult<()> {
        assert!(view.pixel_viewport().is_valid());
        let delay = self.activity.draw_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.activity.draws.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn frame_assemble(
        &mut self,
        _view: &mut ChannelView<'_>,
        frames: &[frameweave::image::ImageFrame],
    ) -> ClientResult<()> {
        self.activity
            .assembled
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

struct CountingWindow {
    inner: HeadlessWindow,
    activity: Arc<Activity>,
}

impl SystemWindow for CountingWindow {
    fn create(
        &mut self,
        pvp: &frameweave::types::PixelViewport,
    ) -> ClientResult<frameweave::types::PixelViewport> {
        self.inner.create(pvp)
    }
    fn destroy(&mut self) {
        self.inner.destroy();
    }
    fn make_current(&mut self) -> ClientResult<()> {
        self.inner.make_current()
    }
    fn swap(&mut self) -> ClientResult<()> {
        self.activity.swaps.fetch_add(1, Ordering::Relaxed);
        self.inner.swap()
    }
    fn finish(&mut self) {
        self.inner.finish();
    }
    fn pixel_viewport(&self) -> frameweave::types::PixelViewport {
        self.inner.pixel_viewport()
    }
}

struct Quiet;
#[async_trait::async_trait]
impl NodeHandler for Quiet {}
impl PipeHandler for Quiet {}
impl WindowHandler for Quiet {}

impl NodeFactory for CountingFactory {
    fn create_node(&self) -> Box<dyn NodeHandler> {
        Box::new(Quiet)
    }
    fn create_pipe(&self) -> Box<dyn PipeHandler> {
        Box::new(Quiet)
    }
    fn create_window(&self) -> (Box<dyn SystemWindow>, Box<dyn WindowHandler>) {
        (
            Box::new(CountingWindow {
                inner: HeadlessWindow::default(),
                activity: self.activity.clone(),
            }),
            Box::new(Quiet),
        )
    }
    fn create_channel(&self) -> Box<dyn ChannelHandler> {
        Box::new(CountingChannel {
            activity: self.activity.clone(),
        })
    }
}

fn simple_node(name: &str, channel: &str) -> NodeSpec {
    let mut window = WindowSpec::new(format!("{name}.window"));
    window.channels.push(ChannelSpec::new(channel));
    let mut pipe = PipeSpec::new(format!("{name}.pipe"));
    pipe.windows.push(window);
    let mut node = NodeSpec::new(name, ConnectionDescription::default());
    node.pipes.push(pipe);
    node
}

/// Start one in-process render client and attach its peer to the n-th
/// config node once the connection is up
async fn join_client(
    server: &Server,
    config: &frameweave_server::config::Config,
    activity: Arc<Activity>,
    index: usize,
) -> tokio::task::JoinHandle<ClientResult<()>> {
    let description = server.listener_description();
    let handle = tokio::spawn(Client::run(
        ClientOptions::direct(description),
        Arc::new(CountingFactory { activity }),
    ));

    let local = server.local_node().clone();
    let start = tokio::time::Instant::now();
    loop {
        if local.connected_peers().len() > index {
            break;
        }
        assert!(start.elapsed() < DEADLINE, "client never connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // attachment order follows connection order
    let mut peers = local.connected_peers();
    peers.sort_by_key(|p| p.node_id());
    // pick the peer not yet attached to an earlier node
    let attached: Vec<_> = config
        .nodes()
        .iter()
        .map(|n| n.node_id())
        .collect();
    let peer = peers
        .into_iter()
        .find(|p| !attached.contains(&p.node_id()))
        .expect("no unattached peer");
    config.nodes()[index].attach_peer(peer);
    handle
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_runs_ten_frames() {
    let server = Server::listen(ListenOptions::default()).await.unwrap();
    let spec = ConfigSpec {
        latency: 1,
        nodes: vec![simple_node("render", "channel")],
        compounds: vec![Compound::leaf("channel")],
    };
    let mut config = server.new_config(spec).unwrap();
    let activity = Arc::new(Activity::default());
    let client = join_client(&server, &config, activity.clone(), 0).await;

    config.init(1).await.expect("init failed");
    // no swap groups configured, so no barrier exists
    assert_eq!(config.planner().group_size("lock"), 0);

    let mut issued = Vec::new();
    for _ in 0..10 {
        issued.push(config.start_frame().unwrap());
        config.finish_frame().await.unwrap();
        // the latency window keeps at most two frames outstanding
        assert!(config.current_frame() - config.finished_frame() <= 2);
    }
    config.finish_all_frames().await.unwrap();
    assert_eq!(issued, (1..=10).collect::<Vec<_>>());
    assert_eq!(config.finished_frame(), 10);
    assert_eq!(activity.draws.load(Ordering::Relaxed), 10);
    assert_eq!(activity.swaps.load(Ordering::Relaxed), 10);

    config.exit().await.expect("exit failed");
    client.await.unwrap().expect("client failed");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_swap_lock_and_finish_together() {
    let server = Server::listen(ListenOptions::default()).await.unwrap();
    let spec = ConfigSpec {
        latency: 1,
        nodes: vec![
            simple_node("render1", "channel.left"),
            simple_node("render2", "channel.right"),
        ],
        compounds: vec![Compound {
            swap_barrier: Some("framelock".into()),
            children: vec![
                Compound::leaf_viewport(
                    "channel.left",
                    Viewport {
                        x: 0.0,
                        y: 0.0,
                        w: 0.5,
                        h: 1.0,
                    },
                ),
                Compound::leaf_viewport(
                    "channel.right",
                    Viewport {
                        x: 0.5,
                        y: 0.0,
                        w: 0.5,
                        h: 1.0,
                    },
                ),
            ],
            ..Default::default()
        }],
    };
    let mut config = server.new_config(spec).unwrap();
    let left = Arc::new(Activity::default());
    let right = Arc::new(Activity::default());
    let client1 = join_client(&server, &config, left.clone(), 0).await;
    let client2 = join_client(&server, &config, right.clone(), 1).await;

    config.init(1).await.expect("init failed");
    assert_eq!(config.planner().group_size("framelock"), 2);

    for _ in 0..5 {
        config.start_frame().unwrap();
        config.finish_frame().await.unwrap();
    }
    config.finish_all_frames().await.unwrap();
    assert_eq!(config.finished_frame(), 5);
    assert_eq!(left.draws.load(Ordering::Relaxed), 5);
    assert_eq!(right.draws.load(Ordering::Relaxed), 5);
    assert_eq!(left.swaps.load(Ordering::Relaxed), 5);
    assert_eq!(right.swaps.load(Ordering::Relaxed), 5);

    config.exit().await.expect("exit failed");
    client1.await.unwrap().expect("client 1 failed");
    client2.await.unwrap().expect("client 2 failed");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sort_last_sources_are_assembled_at_the_destination() {
    let server = Server::listen(ListenOptions::default()).await.unwrap();
    let spec = ConfigSpec {
        latency: 1,
        nodes: vec![
            simple_node("render1", "channel.dest"),
            simple_node("render2", "channel.src"),
        ],
        compounds: vec![Compound {
            channel: Some("channel.dest".into()),
            children: vec![
                Compound::leaf_range(
                    "channel.dest",
                    Range {
                        start: 0.0,
                        end: 0.5,
                    },
                ),
                Compound::leaf_range(
                    "channel.src",
                    Range {
                        start: 0.5,
                        end: 1.0,
                    },
                ),
            ],
            ..Default::default()
        }],
    };
    let mut config = server.new_config(spec).unwrap();
    let dest = Arc::new(Activity::default());
    let src = Arc::new(Activity::default());
    let client1 = join_client(&server, &config, dest.clone(), 0).await;
    let client2 = join_client(&server, &config, src.clone(), 1).await;

    config.init(1).await.expect("init failed");
    for _ in 0..4 {
        config.start_frame().unwrap();
        config.finish_frame().await.unwrap();
    }
    config.finish_all_frames().await.unwrap();

    // the exit walk rides the pipe queues behind the last assembly
    config.exit().await.expect("exit failed");
    client1.await.unwrap().expect("client 1 failed");
    client2.await.unwrap().expect("client 2 failed");

    // one source image per frame arrived at the destination channel
    assert_eq!(dest.assembled.load(Ordering::Relaxed), 4);
    assert_eq!(src.assembled.load(Ordering::Relaxed), 0);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn draw_sync_throttles_where_async_runs_ahead() {
    async fn run_frames(model: ThreadModel, delay_ms: u64, frames: u32) -> Duration {
        let server = Server::listen(ListenOptions::default()).await.unwrap();
        let mut node = simple_node("render", "channel");
        node.thread_model = model;
        let spec = ConfigSpec {
            latency: 2,
            nodes: vec![node],
            compounds: vec![Compound::leaf("channel")],
        };
        let mut config = server.new_config(spec).unwrap();
        let activity = Arc::new(Activity::default());
        activity.draw_delay_ms.store(delay_ms, Ordering::Relaxed);
        let client = join_client(&server, &config, activity.clone(), 0).await;

        config.init(1).await.expect("init failed");
        let start = tokio::time::Instant::now();
        for _ in 0..frames {
            config.start_frame().unwrap();
            config.finish_frame().await.unwrap();
        }
        let elapsed = start.elapsed();
        config.finish_all_frames().await.unwrap();
        config.exit().await.expect("exit failed");
        client.await.unwrap().expect("client failed");
        server.shutdown().await;
        elapsed
    }

    // with a 200 ms draw and latency 2, an ASYNC node acknowledges
    // frames without waiting for the pipe, while DRAW_SYNC pays for
    // every draw before releasing the frame
    let run_ahead = run_frames(ThreadModel::Async, 200, 3).await;
    let throttled = run_frames(ThreadModel::DrawSync, 200, 3).await;
    assert!(
        run_ahead < Duration::from_millis(300),
        "ASYNC should run ahead, took {run_ahead:?}"
    );
    assert!(
        throttled >= Duration::from_millis(200),
        "DRAW_SYNC should wait for draws, took {throttled:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn losing_a_node_fails_the_frame_and_the_config_recovers() {
    let server = Server::listen(ListenOptions::default()).await.unwrap();
    let spec = ConfigSpec {
        latency: 0,
        nodes: vec![simple_node("render", "channel")],
        compounds: vec![Compound::leaf("channel")],
    };
    let mut config = server.new_config(spec).unwrap();
    config.set_timeout(Duration::from_secs(2));

    // run the client on its own runtime so the test can kill the whole
    // process-alike at once
    let description = server.listener_description();
    let activity = Arc::new(Activity::default());
    let client_activity = activity.clone();
    let (kill_tx, kill_rx) = std::sync::mpsc::channel::<()>();
    let client_thread = std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let client = tokio::spawn(Client::run(
                ClientOptions::direct(description),
                Arc::new(CountingFactory {
                    activity: client_activity,
                }),
            ));
            tokio::task::spawn_blocking(move || {
                let _ = kill_rx.recv();
            })
            .await
            .unwrap();
            client.abort();
        });
        // dropping the runtime tears down every client task and socket
    });

    let local = server.local_node().clone();
    let start = tokio::time::Instant::now();
    while local.connected_peers().is_empty() {
        assert!(start.elapsed() < DEADLINE, "client never connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    config.nodes()[0].attach_peer(local.connected_peers().remove(0));

    config.init(1).await.expect("init failed");
    config.start_frame().unwrap();
    config.finish_frame().await.unwrap();

    // slow the draw down so frame 2 is still in flight when the render
    // process dies
    activity.draw_delay_ms.store(500, Ordering::Relaxed);
    config.start_frame().unwrap();
    kill_tx.send(()).unwrap();
    client_thread.join().unwrap();

    let err = config.finish_frame().await.unwrap_err();
    match err {
        ServerError::FrameFailed { frame, .. } => assert_eq!(frame, 2),
        other => panic!("unexpected error {other}"),
    }

    // the node dropped out; the config can still exit cleanly
    config.exit().await.expect("exit after node loss failed");
    server.shutdown().await;
}

#[tokio::test]
async fn window_without_channels_fails_init_with_a_diagnostic() {
    let server = Server::listen(ListenOptions::default()).await.unwrap();
    let mut node = simple_node("render", "channel");
    node.pipes[0]
        .windows
        .push(WindowSpec::new("render.window.empty"));
    let spec = ConfigSpec {
        latency: 1,
        nodes: vec![node],
        compounds: vec![Compound::leaf("channel")],
    };
    let mut config = server.new_config(spec).unwrap();
    let err = config.init(1).await.unwrap_err();
    match err {
        ServerError::InitFailed(reason) => {
            assert!(reason.contains("has no channels"), "got: {reason}")
        }
        other => panic!("unexpected error {other}"),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_compound_channel_is_rejected() {
    let server = Server::listen(ListenOptions::default()).await.unwrap();
    let spec = ConfigSpec {
        latency: 1,
        nodes: vec![simple_node("render", "channel")],
        compounds: vec![Compound::leaf("channel.typo")],
    };
    let mut config = server.new_config(spec).unwrap();
    let err = config.init(1).await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidConfig(_)));
    server.shutdown().await;
}
