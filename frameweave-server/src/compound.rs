// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Compounds: how a destination channel is composed from source
//! channels.
//!
//! A leaf compound names a channel and the share of the work it draws,
//! as an image-space viewport (sort-first) and an object-space range
//! (sort-last). A parent compound names the destination channel;
//! sources on other channels read their result back after drawing and
//! the destination assembles them. A compound may name a swap group,
//! barriering the buffer swaps of every window under it.

use std::collections::BTreeSet;

use frameweave::types::{Range, Viewport};

/// A node of the compound tree
#[derive(Debug, Clone)]
pub struct Compound {
    /// The channel this compound renders to
    pub channel: Option<String>,
    /// Image-space share of the parent
    pub viewport: Viewport,
    /// Object-space share of the parent
    pub range: Range,
    /// Swap group joined by every window under this compound
    pub swap_barrier: Option<String>,
    /// Source compounds composited into this one
    pub children: Vec<Compound>,
}

impl Default for Compound {
    fn default() -> Self {
        Self {
            channel: None,
            viewport: Viewport::FULL,
            range: Range::ALL,
            swap_barrier: None,
            children: Vec::new(),
        }
    }
}

/// One channel operation of one frame, in pipe-queue order
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOp {
    /// Clear the channel viewport
    Clear,
    /// Draw the channel's share
    Draw,
    /// Read the result back and ship it to the destination channel
    Readback {
        /// Name of the destination channel
        dest: String,
    },
    /// Composite the inputs of `expected` source channels
    Assemble {
        /// Number of input frames to wait for
        expected: u32,
    },
}

/// A planned channel task of one frame
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPlan {
    /// The executing channel
    pub channel: String,
    /// The task's image-space share of its window
    pub viewport: Viewport,
    /// The task's object-space share
    pub range: Range,
    /// The operation
    pub op: TaskOp,
}

impl Compound {
    /// A leaf drawing the full work on one channel
    pub fn leaf(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    /// A leaf drawing an object-space share on one channel
    pub fn leaf_range(channel: impl Into<String>, range: Range) -> Self {
        Self {
            channel: Some(channel.into()),
            range,
            ..Default::default()
        }
    }

    /// A leaf drawing an image-space share on one channel
    pub fn leaf_viewport(channel: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            channel: Some(channel.into()),
            viewport,
            ..Default::default()
        }
    }

    /// Every channel referenced below (and including) this compound
    pub fn used_channels(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_channels(&mut out);
        out
    }

    fn collect_channels(&self, out: &mut BTreeSet<String>) {
        if let Some(channel) = &self.channel {
            out.insert(channel.clone());
        }
        for child in &self.children {
            child.collect_channels(out);
        }
    }

    /// Every (channel, swap group) pairing declared below this compound
    pub fn swap_groups(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.collect_swap_groups(None, &mut out);
        out
    }

    fn collect_swap_groups(&self, inherited: Option<&str>, out: &mut Vec<(String, String)>) {
        let group = self.swap_barrier.as_deref().or(inherited);
        if let (Some(channel), Some(group)) = (&self.channel, group) {
            out.push((channel.clone(), group.to_string()));
        }
        for child in &self.children {
            child.collect_swap_groups(group, out);
        }
    }

    /// Plan the channel tasks of one frame, in execution order per
    /// channel: clear, draw, then readback or assembly
    pub fn plan_tasks(&self) -> Vec<TaskPlan> {
        let mut out = Vec::new();
        self.plan_into(&Viewport::FULL, &Range::ALL, None, &mut out);
        out
    }

    fn plan_into(
        &self,
        viewport: &Viewport,
        range: &Range,
        dest: Option<&str>,
        out: &mut Vec<TaskPlan>,
    ) {
        let viewport = compose_viewports(viewport, &self.viewport);
        let range = compose_ranges(range, &self.range);
        let dest = self.channel.as_deref().or(dest);

        if self.children.is_empty() {
            // a leaf draws its share; when the destination differs it
            // also reads back
            let Some(channel) = &self.channel else { return };
            if range.is_empty() {
                return;
            }
            out.push(TaskPlan {
                channel: channel.clone(),
                viewport,
                range,
                op: TaskOp::Clear,
            });
            out.push(TaskPlan {
                channel: channel.clone(),
                viewport,
                range,
                op: TaskOp::Draw,
            });
            if let Some(dest) = dest {
                if dest != channel {
                    out.push(TaskPlan {
                        channel: channel.clone(),
                        viewport,
                        range,
                        op: TaskOp::Readback {
                            dest: dest.to_string(),
                        },
                    });
                }
            }
            return;
        }

        for child in &self.children {
            child.plan_into(&viewport, &range, dest, out);
        }

        // the destination assembles every source that reads back to it
        if let Some(channel) = &self.channel {
            let expected = out
                .iter()
                .filter(|task| matches!(&task.op, TaskOp::Readback { dest } if dest == channel))
                .count() as u32;
            if expected > 0 {
                let draws_itself = out
                    .iter()
                    .any(|task| task.channel == *channel && task.op == TaskOp::Draw);
                if !draws_itself {
                    out.push(TaskPlan {
                        channel: channel.clone(),
                        viewport,
                        range,
                        op: TaskOp::Clear,
                    });
                }
                out.push(TaskPlan {
                    channel: channel.clone(),
                    viewport,
                    range,
                    op: TaskOp::Assemble { expected },
                });
            }
        }
    }
}

fn compose_viewports(parent: &Viewport, child: &Viewport) -> Viewport {
    Viewport {
        x: parent.x + child.x * parent.w,
        y: parent.y + child.y * parent.h,
        w: parent.w * child.w,
        h: parent.h * child.h,
    }
}

fn compose_ranges(parent: &Range, child: &Range) -> Range {
    let span = parent.end - parent.start;
    Range {
        start: parent.start + child.start * span,
        end: parent.start + child.end * span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_draws_everything() {
        let compound = Compound::leaf("channel");
        let tasks = compound.plan_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].op, TaskOp::Clear);
        assert_eq!(tasks[1].op, TaskOp::Draw);
        assert!(tasks[1].range.is_full());
    }

    #[test]
    fn empty_range_leaf_is_skipped() {
        let compound = Compound::leaf_range(
            "channel",
            Range {
                start: 0.3,
                end: 0.3,
            },
        );
        assert!(compound.plan_tasks().is_empty());
    }

    #[test]
    fn sort_last_sources_read_back_to_the_destination() {
        let compound = Compound {
            channel: Some("dest".into()),
            children: vec![
                Compound::leaf_range(
                    "dest",
                    Range {
                        start: 0.0,
                        end: 0.5,
                    },
                ),
                Compound::leaf_range(
                    "source",
                    Range {
                        start: 0.5,
                        end: 1.0,
                    },
                ),
            ],
            ..Default::default()
        };
        let tasks = compound.plan_tasks();
        // dest: clear+draw, source: clear+draw+readback, dest: assemble
        assert_eq!(tasks.len(), 6);
        assert_eq!(
            tasks[4].op,
            TaskOp::Readback {
                dest: "dest".into()
            }
        );
        assert_eq!(tasks[5].op, TaskOp::Assemble { expected: 1 });
        assert_eq!(tasks[5].channel, "dest");
    }

    #[test]
    fn sort_first_children_compose_viewports() {
        let compound = Compound {
            children: vec![
                Compound::leaf_viewport(
                    "left",
                    Viewport {
                        x: 0.0,
                        y: 0.0,
                        w: 0.5,
                        h: 1.0,
                    },
                ),
                Compound::leaf_viewport(
                    "right",
                    Viewport {
                        x: 0.5,
                        y: 0.0,
                        w: 0.5,
                        h: 1.0,
                    },
                ),
            ],
            ..Default::default()
        };
        let tasks = compound.plan_tasks();
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[2].channel, "right");
        assert_eq!(tasks[2].viewport.x, 0.5);
        // no destination channel, so nothing reads back
        assert!(!tasks
            .iter()
            .any(|t| matches!(t.op, TaskOp::Readback { .. })));
    }

    #[test]
    fn swap_groups_are_inherited_by_children() {
        let compound = Compound {
            swap_barrier: Some("lock".into()),
            children: vec![Compound::leaf("a"), Compound::leaf("b")],
            ..Default::default()
        };
        let groups = compound.swap_groups();
        assert_eq!(
            groups,
            vec![("a".into(), "lock".into()), ("b".into(), "lock".into())]
        );
    }
}
