use crate::pawn::{pawn_from_blob, Pawn, PAWN_KIND_DRONE, PAWN_KIND_PLAYER};
use glam::{Quat, Vec3};
use tachyon::prelude::*;
use tachyon::state::node;

/// World-root node id; every pawn group hangs off it.
const WORLD_ROOT_ID: u32 = 1;

/// Server-owned pawn groups start here.
const SERVER_ID_BASE: u32 = 100;

const DRONE_RADIUS: f32 = 25.0;
const DRONE_ANGULAR_SPEED: f32 = 0.4;

/// Demo server: one autonomous drone circling the arena, plus whatever
/// pawns the clients register.
pub struct ArenaServer {
    drone_id: u32,
}

impl ArenaServer {
    pub fn new() -> ArenaServer {
        ArenaServer { drone_id: 0 }
    }
}

impl RemoteFactory for ArenaServer {
    fn create_remote_object(
        &mut self,
        _parent_id: u32,
        _id: u32,
        creation_blob: &[u8],
    ) -> Option<Box<dyn ReplicableObject>> {
        pawn_from_blob(creation_blob).map(|pawn| Box::new(pawn) as Box<dyn ReplicableObject>)
    }
}

impl ServerApp for ArenaServer {
    fn init(&mut self, tree: &mut StateTree) {
        tree.create_node(0, WORLD_ROOT_ID, NodeType::Complex, Backing::None, 0, None, true);

        let drone = Pawn::new(PAWN_KIND_DRONE, "Drone");
        let next = tree.create_node_group(
            WORLD_ROOT_ID,
            SERVER_ID_BASE,
            Box::new(drone),
            Some(&[PAWN_KIND_DRONE]),
            true,
        );
        assert_eq!(next, SERVER_ID_BASE + 4);
        self.drone_id = SERVER_ID_BASE;
    }

    fn tick(&mut self, _delta: f32, absolute: f64, tree: &mut StateTree) {
        let angle = absolute as f32 * DRONE_ANGULAR_SPEED;
        let position = Vec3::new(angle.cos(), 0.0, angle.sin()) * DRONE_RADIUS;
        let orientation = Quat::from_rotation_y(-angle);

        let (position_id, orientation_id, _) = Pawn::member_node_ids(self.drone_id);

        let mut bytes = [0u8; 16];
        node::write_vec3(&mut bytes[..12], position);
        tree.write_value(position_id, &bytes[..12]);

        node::write_vec4(&mut bytes, glam::Vec4::from(orientation));
        tree.write_value(orientation_id, &bytes);
    }

    fn chat_command(
        &mut self,
        client: &ClientInfo,
        _destination: u16,
        line: &str,
    ) -> Option<String> {
        match line.trim_start_matches(|c| c == '/' || c == '\\') {
            "ping" => Some(format!("pong, {}", client.user_name)),
            _ => None,
        }
    }
}

/// Demo client: registers one player pawn it owns authoritatively and
/// steers it in a slow orbit opposite the drone.
pub struct ArenaClient {
    pawn_base: u32,
    registered: bool,
}

impl ArenaClient {
    /// Client-created node ids are carved out of a per-nonce range so two
    /// clients never collide (parent ids must stay below 65536 on the
    /// wire).
    pub fn new(nonce: u16) -> ArenaClient {
        ArenaClient {
            pawn_base: 2000 + (u32::from(nonce) % 60) * 1000,
            registered: false,
        }
    }

    #[inline]
    pub fn pawn_base(&self) -> u32 {
        self.pawn_base
    }
}

impl RemoteFactory for ArenaClient {
    fn create_remote_object(
        &mut self,
        _parent_id: u32,
        _id: u32,
        creation_blob: &[u8],
    ) -> Option<Box<dyn ReplicableObject>> {
        pawn_from_blob(creation_blob).map(|pawn| Box::new(pawn) as Box<dyn ReplicableObject>)
    }
}

impl ClientApp for ArenaClient {
    fn tick(
        &mut self,
        _delta: f32,
        absolute: f64,
        tree: &mut StateTree,
        _sender: &MessageSender,
    ) {
        if !self.registered {
            // The world root mirrors in from the server; until it does, our
            // pawn has nowhere to hang.
            if tree.find(WORLD_ROOT_ID).is_none() {
                return;
            }

            let pawn = Pawn::new(PAWN_KIND_PLAYER, "Player");
            tree.create_node_group(
                WORLD_ROOT_ID,
                self.pawn_base,
                Box::new(pawn),
                Some(&[PAWN_KIND_PLAYER]),
                true,
            );
            self.registered = true;
        }

        let angle = -(absolute as f32) * DRONE_ANGULAR_SPEED;
        let position = Vec3::new(angle.cos(), 0.0, angle.sin()) * (DRONE_RADIUS * 0.5);

        let (position_id, _, _) = Pawn::member_node_ids(self.pawn_base);
        let mut bytes = [0u8; 12];
        node::write_vec3(&mut bytes, position);
        tree.write_value(position_id, &bytes);
    }
}
