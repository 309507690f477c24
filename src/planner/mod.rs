//! Trajectory planner (§4.5)
//!
//! Pure function: no state, no lock, no I/O. The replan scheduler and
//! mission store both call this off their own critical section (§4.6).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::math::{sub, Vec3};
use crate::models::{PayloadCapabilities, Trajectory, TrajectoryStatus, Waypoint};

const WAYPOINT_COUNT: usize = 6;
const WAYPOINT_SPACING_SECS: i64 = 60;
const TERRAIN_CLEARANCE_FLOOR_M: f64 = 1000.0;

pub struct PlannerInput {
    pub start: Vec3,
    pub target: Vec3,
    pub stealth_required: bool,
    pub capabilities: PayloadCapabilities,
    pub now: DateTime<Utc>,
}

/// Builds an ordered 6-waypoint trajectory linearly interpolated
/// between `start` and `target`, with a terrain-clearance floor
/// applied to interior waypoints.
pub fn plan(input: PlannerInput) -> Result<Trajectory> {
    let PlannerInput { start, target, stealth_required, capabilities, now } = input;

    let floor = TERRAIN_CLEARANCE_FLOOR_M.max(capabilities.min_altitude);
    let mut positions = Vec::with_capacity(WAYPOINT_COUNT);
    for i in 0..WAYPOINT_COUNT {
        let t = i as f64 / (WAYPOINT_COUNT - 1) as f64;
        let mut pos = Vec3::new(
            start.x + (target.x - start.x) * t,
            start.y + (target.y - start.y) * t,
            start.z + (target.z - start.z) * t,
        );
        if i > 0 && i < WAYPOINT_COUNT - 1 {
            pos.z = pos.z.max(floor);
        }
        positions.push(pos);
    }

    let mut waypoints = Vec::with_capacity(WAYPOINT_COUNT);
    for (i, pos) in positions.iter().enumerate() {
        let velocity = if i + 1 < positions.len() {
            sub(positions[i + 1], *pos)
        } else {
            Vec3::zero()
        };
        waypoints.push(Waypoint {
            id: Uuid::new_v4(),
            position: *pos,
            velocity,
            timestamp: now + ChronoDuration::seconds(WAYPOINT_SPACING_SECS * i as i64),
            stealth: stealth_required,
        });
    }

    let stealth_score = if stealth_required { 0.85 } else { 0.50 };

    Ok(Trajectory {
        id: Uuid::new_v4(),
        waypoints,
        stealth_score,
        confidence: 0.92,
        status: TrajectoryStatus::Planned,
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(start: Vec3, target: Vec3, stealth: bool) -> PlannerInput {
        PlannerInput {
            start,
            target,
            stealth_required: stealth,
            capabilities: PayloadCapabilities::default(),
            now: Utc::now(),
        }
    }

    #[test]
    fn produces_six_waypoints_spaced_sixty_seconds() {
        let traj = plan(input(Vec3::zero(), Vec3::new(6000.0, 0.0, 0.0), false)).unwrap();
        assert_eq!(traj.waypoints.len(), 6);
        let gap = traj.waypoints[1].timestamp - traj.waypoints[0].timestamp;
        assert_eq!(gap, ChronoDuration::seconds(60));
    }

    #[test]
    fn interior_waypoints_respect_terrain_floor() {
        let traj = plan(input(Vec3::new(0.0, 0.0, 10.0), Vec3::new(6000.0, 0.0, 20.0), false)).unwrap();
        for wp in &traj.waypoints[1..5] {
            assert!(wp.position.z >= TERRAIN_CLEARANCE_FLOOR_M);
        }
    }

    #[test]
    fn interior_floor_honors_higher_min_altitude() {
        let mut caps = PayloadCapabilities::default();
        caps.min_altitude = 2000.0;
        let traj = plan(PlannerInput {
            start: Vec3::zero(),
            target: Vec3::new(6000.0, 0.0, 0.0),
            stealth_required: false,
            capabilities: caps,
            now: Utc::now(),
        })
        .unwrap();
        assert!(traj.waypoints[2].position.z >= 2000.0);
    }

    #[test]
    fn last_waypoint_has_zero_velocity() {
        let traj = plan(input(Vec3::zero(), Vec3::new(6000.0, 0.0, 0.0), false)).unwrap();
        let last = traj.waypoints.last().unwrap();
        assert_eq!(last.velocity, Vec3::zero());
    }

    #[test]
    fn stealth_required_raises_stealth_score() {
        let traj = plan(input(Vec3::zero(), Vec3::new(100.0, 0.0, 0.0), true)).unwrap();
        assert_eq!(traj.stealth_score, 0.85);
    }
}
