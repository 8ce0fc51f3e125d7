// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Swap-barrier planning.
//!
//! Compounds declare named swap groups; the planner resolves them into
//! equivalence classes of windows and backs each class with one cluster
//! barrier whose participant count is the class size. Every frame the
//! controller commits one barrier cycle per class; membership changes
//! (a window leaving with its failed node) simply produce the next
//! cycle with a new count.

use std::collections::HashMap;
use std::sync::Arc;

use frameweave_net::barrier::Barrier;
use frameweave_net::session::Session;
use frameweave_net::{ObjectId, Version};

use crate::compound::Compound;
use crate::node::ServerNode;
use crate::window::ServerWindow;
use crate::ServerResult;

struct SwapClass {
    barrier: Barrier,
    windows: Vec<Arc<ServerWindow>>,
}

/// Builds and maintains the swap-locked window classes of a config
#[derive(Default)]
pub struct SwapPlanner {
    classes: HashMap<String, SwapClass>,
}

/// The barrier cycle of one frame: group name to barrier object and the
/// version windows must enter at
pub type SwapCycle = HashMap<String, (ObjectId, Version)>;

impl SwapPlanner {
    /// An empty planner
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)build the equivalence classes from the compound tree,
    /// considering only windows on active nodes. Newly seen groups get
    /// a barrier registered in `session`.
    pub fn plan(
        &mut self,
        session: &Arc<Session>,
        compounds: &[Compound],
        nodes: &[Arc<ServerNode>],
    ) -> ServerResult<()> {
        let mut members: HashMap<String, Vec<Arc<ServerWindow>>> = HashMap::new();

        for compound in compounds {
            for (channel, group) in compound.swap_groups() {
                let Some(window) = find_window(nodes, &channel) else {
                    continue;
                };
                let windows = members.entry(group).or_default();
                if !windows.iter().any(|w| Arc::ptr_eq(w, &window)) {
                    windows.push(window);
                }
            }
        }

        // clear stale assignments before applying the new plan
        for node in nodes {
            for pipe in node.pipes() {
                for window in pipe.windows() {
                    window.set_swap_group(None);
                }
            }
        }

        for (group, windows) in members {
            if !self.classes.contains_key(&group) {
                let barrier = Barrier::new(0);
                barrier.register(session)?;
                self.classes.insert(
                    group.clone(),
                    SwapClass {
                        barrier,
                        windows: Vec::new(),
                    },
                );
            }
            for window in &windows {
                window.set_swap_group(Some(group.clone()));
            }
            tracing::debug!("Swap group '{group}' has {} windows", windows.len());
            self.classes
                .get_mut(&group)
                .expect("class just inserted")
                .windows = windows;
        }
        Ok(())
    }

    /// Commit one barrier cycle per non-empty class, returning what
    /// each window's frame tasks must enter
    pub fn commit_cycle(&self) -> ServerResult<SwapCycle> {
        let mut cycle = HashMap::new();
        for (group, class) in &self.classes {
            if class.windows.is_empty() {
                continue;
            }
            class.barrier.set_height(class.windows.len() as u32);
            let version = class.barrier.commit()?;
            cycle.insert(group.clone(), (class.barrier.id(), version));
        }
        Ok(cycle)
    }

    /// The number of windows currently in `group`
    pub fn group_size(&self, group: &str) -> usize {
        self.classes
            .get(group)
            .map(|class| class.windows.len())
            .unwrap_or(0)
    }
}

fn find_window(nodes: &[Arc<ServerNode>], channel: &str) -> Option<Arc<ServerWindow>> {
    for node in nodes {
        if !node.is_active() {
            continue;
        }
        for pipe in node.pipes() {
            for window in pipe.windows() {
                if window.channel_by_name(channel).is_some() {
                    return Some(window.clone());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ChannelSpec, NodeSpec, PipeSpec, WindowSpec};
    use crate::EntityState;
    use frameweave_net::connection::ConnectionDescription;
    use frameweave_net::node::{ListenOptions, LocalNode};

    fn node_with_channels(name: &str, channels: &[&str]) -> Arc<ServerNode> {
        let mut window = WindowSpec::new(format!("{name}.window"));
        window.channels = channels.iter().map(|c| ChannelSpec::new(*c)).collect();
        let mut pipe = PipeSpec::new(format!("{name}.pipe"));
        pipe.windows.push(window);
        let mut spec = NodeSpec::new(name, ConnectionDescription::default());
        spec.pipes.push(pipe);
        let node = Arc::new(ServerNode::new(&spec));
        node.set_used(1);
        node.set_state(EntityState::Running);
        for pipe in node.pipes() {
            pipe.set_used(1);
            for window in pipe.windows() {
                window.set_used(1);
            }
        }
        node
    }

    #[tokio::test]
    async fn windows_sharing_a_group_share_a_barrier() {
        let local = LocalNode::listen(ListenOptions::default()).await.unwrap();
        let session = local.new_session("plan-test");

        let nodes = vec![
            node_with_channels("a", &["channel.a"]),
            node_with_channels("b", &["channel.b"]),
        ];
        let compound = Compound {
            swap_barrier: Some("lock".into()),
            children: vec![
                Compound::leaf("channel.a"),
                Compound::leaf("channel.b"),
            ],
            ..Default::default()
        };

        let mut planner = SwapPlanner::new();
        planner.plan(&session, &[compound], &nodes).unwrap();
        assert_eq!(planner.group_size("lock"), 2);

        let cycle = planner.commit_cycle().unwrap();
        let (barrier, version) = cycle.get("lock").expect("group missing from cycle");
        assert!(barrier.is_valid());
        assert_eq!(*version, Version(1));

        // both windows carry the assignment
        for node in &nodes {
            let window = &node.pipes()[0].windows()[0];
            assert_eq!(window.swap_group().as_deref(), Some("lock"));
        }
        local.stop();
    }

    #[tokio::test]
    async fn failed_nodes_leave_their_group() {
        let local = LocalNode::listen(ListenOptions::default()).await.unwrap();
        let session = local.new_session("replan-test");

        let nodes = vec![
            node_with_channels("a", &["channel.a"]),
            node_with_channels("b", &["channel.b"]),
            node_with_channels("c", &["channel.c"]),
        ];
        let compound = Compound {
            swap_barrier: Some("lock".into()),
            children: vec![
                Compound::leaf("channel.a"),
                Compound::leaf("channel.b"),
                Compound::leaf("channel.c"),
            ],
            ..Default::default()
        };

        let mut planner = SwapPlanner::new();
        planner.plan(&session, &[compound.clone()], &nodes).unwrap();
        assert_eq!(planner.group_size("lock"), 3);
        planner.commit_cycle().unwrap();

        // node c dies; the re-plan shrinks the class to two windows and
        // the next cycle bumps the barrier version
        nodes[2].set_state(EntityState::Stopping);
        planner.plan(&session, &[compound], &nodes).unwrap();
        assert_eq!(planner.group_size("lock"), 2);
        let cycle = planner.commit_cycle().unwrap();
        assert_eq!(cycle.get("lock").unwrap().1, Version(2));
        assert!(nodes[2].pipes()[0].windows()[0].swap_group().is_none());
        local.stop();
    }
}
