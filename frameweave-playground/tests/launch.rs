// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Remote-launch scenario: the server spawns a real render process via
//! the launch command, the child dials back within the launch timeout
//! and renders frames.

use std::time::Duration;

use frameweave::types::Range;
use frameweave_net::connection::{ConnectionDescription, ConnectionKind};
use frameweave_net::node::ListenOptions;
use frameweave_server::compound::Compound;
use frameweave_server::server::Server;
use frameweave_server::spec::{ChannelSpec, ConfigSpec, NodeSpec, PipeSpec, WindowSpec};

#[tokio::test(flavor = "multi_thread")]
async fn launched_client_connects_back_and_renders() {
    let server = Server::listen(ListenOptions {
        hostname: "127.0.0.1".into(),
        ..Default::default()
    })
    .await
    .expect("server failed to listen");

    let exe = env!("CARGO_BIN_EXE_frameweave-playground");
    let description = ConnectionDescription {
        kind: ConnectionKind::Tcpip,
        hostname: "127.0.0.1".into(),
        // nothing listens here; the failed dial triggers the launch
        port: 1,
        launch_command: format!("{exe} --eq-client %c"),
        launch_timeout: Duration::from_secs(20),
        ..Default::default()
    };

    let mut window = WindowSpec::new("launch.window");
    window.channels.push(ChannelSpec::new("channel"));
    let mut pipe = PipeSpec::new("launch.pipe");
    pipe.windows.push(window);
    let mut node = NodeSpec::new("launch.render", description);
    node.pipes.push(pipe);

    let spec = ConfigSpec {
        latency: 1,
        nodes: vec![node],
        compounds: vec![Compound::leaf_range("channel", Range::ALL)],
    };

    let mut config = server.new_config(spec).expect("config build failed");
    config.init(1).await.expect("launched init failed");

    for _ in 0..3 {
        config.start_frame().expect("start frame failed");
        config.finish_frame().await.expect("finish frame failed");
    }
    config.finish_all_frames().await.expect("drain failed");
    assert_eq!(config.finished_frame(), 3);

    config.exit().await.expect("exit failed");
    server.shutdown().await;
}
