// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The demo scenario: one auto-launched render node drawing a spinning
//! model sort-last across two channels of one window, swap-locked.

use std::sync::Arc;
use std::time::Duration;

use frameweave::channel::{ChannelHandler, ChannelView};
use frameweave::client::NodeFactory;
use frameweave::node::NodeHandler;
use frameweave::pipe::PipeHandler;
use frameweave::types::Range;
use frameweave::window::WindowHandler;
use frameweave::window_system::{HeadlessWindow, SystemWindow};
use frameweave::ClientResult;
use frameweave_net::connection::{ConnectionDescription, ConnectionKind};
use frameweave_net::node::ListenOptions;
use frameweave_server::compound::Compound;
use frameweave_server::server::Server;
use frameweave_server::spec::{ChannelSpec, ConfigSpec, NodeSpec, PipeSpec, WindowSpec};
use frameweave_server::ServerResult;

// ========================= Render side ========================= //

/// Handlers for the demo render process
pub struct DemoFactory;

struct DemoNode;
#[async_trait::async_trait]
impl NodeHandler for DemoNode {
    async fn config_init(&mut self, init_id: u32) -> ClientResult<()> {
        tracing::info!("Demo node up (init id {init_id})");
        Ok(())
    }
}

struct DemoPipe;
impl PipeHandler for DemoPipe {}

struct DemoWindow;
impl WindowHandler for DemoWindow {}

struct DemoChannel;

impl ChannelHandler for DemoChannel {
    fn frame_draw(&mut self, view: &mut ChannelView<'_>) -> ClientResult<()> {
        // stand-in for the GL draw: cull against the channel's range
        // and transform by the replicated frame data
        let model = view.frame_data.model_matrix();
        let range = view.range();
        view.set_near_far(0.1, 10.0);
        tracing::debug!(
            "frame {}: draw [{:.2}, {:.2}) of model at {:?}",
            view.context.frame_number,
            range.start,
            range.end,
            model.w_axis
        );
        Ok(())
    }
}

impl NodeFactory for DemoFactory {
    fn create_node(&self) -> Box<dyn NodeHandler> {
        Box::new(DemoNode)
    }
    fn create_pipe(&self) -> Box<dyn PipeHandler> {
        Box::new(DemoPipe)
    }
    fn create_window(&self) -> (Box<dyn SystemWindow>, Box<dyn WindowHandler>) {
        (Box::<HeadlessWindow>::default(), Box::new(DemoWindow))
    }
    fn create_channel(&self) -> Box<dyn ChannelHandler> {
        Box::new(DemoChannel)
    }
}

// ========================= Server side ========================= //

/// The demo configuration: one auto-launched render node, one pipe,
/// one window with a destination and a source channel splitting the
/// range, swap-locked together
fn demo_spec() -> ConfigSpec {
    let launch_command = std::env::current_exe()
        .ok()
        .and_then(|p| p.to_str().map(String::from))
        .map(|exe| format!("{exe} --eq-client %c"))
        .unwrap_or_default();

    let description = ConnectionDescription {
        kind: ConnectionKind::Tcpip,
        hostname: "127.0.0.1".into(),
        // nothing listens here; the failed dial triggers the launch
        port: 1,
        launch_command,
        launch_timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let mut window = WindowSpec::new("demo.window");
    window.channels.push(ChannelSpec::new("channel.dest"));
    window.channels.push(ChannelSpec::new("channel.src"));
    let mut pipe = PipeSpec::new("demo.pipe");
    pipe.windows.push(window);
    let mut node = NodeSpec::new("demo.render", description);
    node.pipes.push(pipe);

    ConfigSpec {
        latency: 1,
        nodes: vec![node],
        compounds: vec![Compound {
            channel: Some("channel.dest".into()),
            swap_barrier: Some("demo.lock".into()),
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
    }
}

/// Drive the demo configuration for `frames` frames
pub async fn run_server(frames: u32) -> ServerResult<()> {
    let server = Server::listen(ListenOptions {
        hostname: "127.0.0.1".into(),
        ..Default::default()
    })
    .await?;
    tracing::info!("Server listening on {}", server.listener_description());

    let mut config = server.new_config(demo_spec())?;
    config.init(1).await?;

    for _ in 0..frames {
        config.frame_data().with_mut(|data| data.spin(0.0, 0.02));
        let frame = config.start_frame()?;
        let finished = config.finish_frame().await?;
        tracing::debug!("Issued frame {frame}, finished through {finished}");
    }
    let finished = config.finish_all_frames().await?;
    tracing::info!("Rendered {finished} frames");

    config.exit().await?;
    server.shutdown().await;
    Ok(())
}
