//! Gameplay systems, run in order once per tick.
//!
//! Everything here is re-run during client replay, so the systems only read
//! the world and [`ArenaTime`]. Paddles are visited in network id order so
//! that server and client resolve simultaneous contacts identically.

use bevy_ecs::prelude::*;
use glam::Vec2;
use kestrel_sync::NetworkId;

use crate::components::{ArenaTime, Paddle, PaddleInput, Position, Puck, Score, Velocity};

/// Half extents of the playing field.
pub const HALF_WIDTH: f32 = 16.0;
pub const HALF_HEIGHT: f32 = 9.0;
/// Half height of each goal mouth on the short walls.
pub const GOAL_HALF_HEIGHT: f32 = 3.0;
pub const PADDLE_RADIUS: f32 = 1.0;
pub const PUCK_RADIUS: f32 = 0.5;
/// Metres per second at full steering.
pub const PADDLE_SPEED: f32 = 10.0;
/// Puck velocity after setup and after every goal (x toward the side that
/// conceded).
pub const KICKOFF_VELOCITY: Vec2 = Vec2::new(6.0, 2.5);

pub fn steer_paddles(mut paddles: Query<(&PaddleInput, &mut Velocity), With<Paddle>>) {
    for (input, mut velocity) in &mut paddles {
        velocity.0 = input.direction() * PADDLE_SPEED;
    }
}

pub fn integrate(time: Res<ArenaTime>, mut bodies: Query<(&Velocity, &mut Position)>) {
    for (velocity, mut position) in &mut bodies {
        position.0 += velocity.0 * time.delta;
    }
}

pub fn confine_paddles(mut paddles: Query<&mut Position, With<Paddle>>) {
    let limit = Vec2::new(HALF_WIDTH - PADDLE_RADIUS, HALF_HEIGHT - PADDLE_RADIUS);
    for mut position in &mut paddles {
        position.0 = position.0.clamp(-limit, limit);
    }
}

/// Bounces the puck off the long walls, the short walls outside the goal
/// mouths, and the paddles.
pub fn deflect_puck(
    paddles: Query<(&NetworkId, &Position), (With<Paddle>, Without<Puck>)>,
    mut pucks: Query<(&mut Position, &mut Velocity), (With<Puck>, Without<Paddle>)>,
) {
    let mut contacts: Vec<(NetworkId, Vec2)> = paddles.iter().map(|(id, p)| (*id, p.0)).collect();
    contacts.sort_by_key(|(id, _)| *id);
    let reach = PADDLE_RADIUS + PUCK_RADIUS;

    for (mut position, mut velocity) in &mut pucks {
        let wall_y = HALF_HEIGHT - PUCK_RADIUS;
        if position.0.y.abs() > wall_y {
            position.0.y = wall_y.copysign(position.0.y);
            velocity.0.y = -velocity.0.y;
        }
        let wall_x = HALF_WIDTH - PUCK_RADIUS;
        if position.0.x.abs() > wall_x && position.0.y.abs() > GOAL_HALF_HEIGHT {
            position.0.x = wall_x.copysign(position.0.x);
            velocity.0.x = -velocity.0.x;
        }

        for &(_, paddle) in &contacts {
            let offset = position.0 - paddle;
            let distance = offset.length();
            if distance >= reach || distance <= f32::EPSILON {
                continue;
            }
            let normal = offset / distance;
            position.0 = paddle + normal * reach;
            let approach = velocity.0.dot(normal);
            if approach < 0.0 {
                velocity.0 -= 2.0 * approach * normal;
            }
        }
    }
}

/// A puck past a short wall is a goal for every paddle on the other half.
/// The puck is served again from the centre spot.
pub fn score_goals(
    mut pucks: Query<(&mut Position, &mut Velocity), (With<Puck>, Without<Paddle>)>,
    mut paddles: Query<(&Position, &mut Score), (With<Paddle>, Without<Puck>)>,
) {
    for (mut position, mut velocity) in &mut pucks {
        if position.0.x.abs() <= HALF_WIDTH {
            continue;
        }
        let conceded = position.0.x.signum();
        for (paddle, mut score) in &mut paddles {
            if paddle.0.x * conceded < 0.0 {
                score.0 += 1;
            }
        }
        position.0 = Vec2::ZERO;
        velocity.0 = Vec2::new(KICKOFF_VELOCITY.x * conceded, KICKOFF_VELOCITY.y);
    }
}
