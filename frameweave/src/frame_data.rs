// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Per-frame parameters, replicated to every render node.
//!
//! [FrameData] is a versioned distributed object mastered on the server.
//! The server commits version `f` right before issuing frame `f`; each
//! pipe blocks until its replica has reached that version before it
//! starts drawing, so all channels of a frame see identical parameters.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use frameweave_net::object::Object;
use frameweave_net::{NetError, NetResult};
use glam::{Mat4, Vec3};

/// Camera, head and model state for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameData {
    /// World-to-eye transform of the tracked observer
    pub camera: Mat4,
    /// Head transform for immersive setups, identity on desktops
    pub head: Mat4,
    /// Model translation applied by every channel
    pub translation: Vec3,
    /// Model rotation in radians around x/y/z
    pub rotation: Vec3,
    /// Application-defined option bits
    pub flags: u64,
}

impl Default for FrameData {
    fn default() -> Self {
        Self {
            camera: Mat4::IDENTITY,
            head: Mat4::IDENTITY,
            translation: Vec3::new(0.0, 0.0, -2.0),
            rotation: Vec3::ZERO,
            flags: 0,
        }
    }
}

impl FrameData {
    /// Advance the model rotation, the default per-frame animation of
    /// the examples
    pub fn spin(&mut self, dx: f32, dy: f32) {
        self.rotation.x += dx;
        self.rotation.y += dy;
    }

    /// The combined model transform for drawing
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.translation)
            * Mat4::from_rotation_x(self.rotation.x)
            * Mat4::from_rotation_y(self.rotation.y)
            * Mat4::from_rotation_z(self.rotation.z)
    }
}

fn put_mat4(buf: &mut BytesMut, m: &Mat4) {
    for v in m.to_cols_array() {
        buf.put_f32_le(v);
    }
}

fn take_mat4(buf: &mut Bytes) -> NetResult<Mat4> {
    if buf.remaining() < 64 {
        return Err(NetError::MalformedPacket("truncated matrix".into()));
    }
    let mut cols = [0.0f32; 16];
    for c in cols.iter_mut() {
        *c = buf.get_f32_le();
    }
    Ok(Mat4::from_cols_array(&cols))
}

fn put_vec3(buf: &mut BytesMut, v: &Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

fn take_vec3(buf: &mut Bytes) -> NetResult<Vec3> {
    if buf.remaining() < 12 {
        return Err(NetError::MalformedPacket("truncated vector".into()));
    }
    Ok(Vec3::new(
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
    ))
}

impl Object for FrameData {
    fn instance_data(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 * 64 + 2 * 12 + 8);
        put_mat4(&mut buf, &self.camera);
        put_mat4(&mut buf, &self.head);
        put_vec3(&mut buf, &self.translation);
        put_vec3(&mut buf, &self.rotation);
        buf.put_u64_le(self.flags);
        buf.freeze()
    }

    fn apply_instance(&mut self, mut data: Bytes) -> NetResult<()> {
        self.camera = take_mat4(&mut data)?;
        self.head = take_mat4(&mut data)?;
        self.translation = take_vec3(&mut data)?;
        self.rotation = take_vec3(&mut data)?;
        if data.remaining() < 8 {
            return Err(NetError::MalformedPacket("truncated frame data".into()));
        }
        self.flags = data.get_u64_le();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_data_roundtrips() {
        let mut data = FrameData::default();
        data.spin(0.1, 0.2);
        data.camera = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        data.flags = 0xdead_beef;

        let mut copy = FrameData::default();
        copy.apply_instance(data.instance_data()).unwrap();
        assert_eq!(copy, data);
    }

    #[test]
    fn model_matrix_includes_translation() {
        let data = FrameData::default();
        let m = data.model_matrix();
        assert_eq!(m.w_axis.z, -2.0);
    }
}
