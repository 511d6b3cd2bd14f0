//! Networked components of the arena.

use bevy_ecs::prelude::*;
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Arena position in metres, origin at the centre spot.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Position(pub Vec2);

/// Metres per second.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Velocity(pub Vec2);

/// A player-controlled paddle.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paddle;

/// The puck.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Puck;

/// Goals scored by a paddle's side.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Score(pub u32);

/// Steering of one paddle for one tick. Each axis is clamped to `-1..=1`.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaddleInput {
    pub x: i8,
    pub y: i8,
}

impl PaddleInput {
    pub fn new(x: i8, y: i8) -> Self {
        Self { x, y }
    }

    /// Unit-free steering direction.
    pub fn direction(&self) -> Vec2 {
        Vec2::new(
            f32::from(self.x.clamp(-1, 1)),
            f32::from(self.y.clamp(-1, 1)),
        )
    }
}

/// Duration of the tick being simulated.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct ArenaTime {
    /// Seconds.
    pub delta: f32,
}
