//! Occlusion avoidance.
//!
//! The camera looks down through the arm, so before every photo the stylus
//! has to leave the part of the screen being inspected. A *full* detour parks
//! it beyond the screen edge in one move. A *step* detour moves in fixed
//! increments so a widget can be matched as soon as it is uncovered.
//!
//! ## Evadability
//!
//! An axis is evadable when the screen extent along it, plus a safety margin,
//! still fits within the arm's travel range. Evadability is fixed for a rig
//! mounting and is computed once.
//!
//! ## Targets
//!
//! On X the arm leaves through the nearer side of the screen. On Y it can only
//! leave through the far side, because the arm body itself shades the near one.

use crate::geometry::StepVector;
use nalgebra::Vector2;

/// Which axes the arm can clear the screen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evadability {
    pub x: bool,
    pub y: bool,
}

impl Evadability {
    /// Compare the screen extent with the arm range per axis, both in arm-frame
    /// steps. `margin` is in steps as well.
    ///
    /// An axis stays evadable while `|extent| <= |range| - margin`.
    pub fn analyze(screen_extent: Vector2<f64>, arm_range: Vector2<f64>, margin: Vector2<f64>) -> Self {
        Self {
            x: screen_extent.x.abs() <= arm_range.x.abs() - margin.x,
            y: screen_extent.y.abs() <= arm_range.y.abs() - margin.y,
        }
    }

    pub fn any(&self) -> bool {
        self.x || self.y
    }
}

/// What a detour request resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetourDecision {
    /// The arm does not cover the inspected region.
    NotBlocking,
    /// Move the whole way out in one go.
    Full(StepVector),
    /// Move one increment toward the outside.
    Step(StepVector),
    /// No axis can clear the screen.
    BlockedImpossible,
}

/// Coordinate on one axis that lies outside the screen.
///
/// `center` is the screen centre on that axis and `distance` the extra clearance
/// past the edge.
pub fn away_screen_length(current: i64, center: i64, distance: i64) -> i64 {
    if center > 0 {
        if current > center {
            center * 2 + distance
        } else {
            -distance
        }
    } else if current > center {
        current
    } else {
        center * 2 - distance
    }
}

/// Whether an arm at `position` covers a region of `region_extent` steps
/// measured from the screen origin.
///
/// On X the arm must be on the same side as the region and within it; on Y it
/// only has to be within its extent.
pub fn is_blocking(position: StepVector, region_extent: Vector2<f64>) -> bool {
    let x = position.x as f64;
    let y = position.y as f64;
    let block_x = x * region_extent.x > 0.0 && x.abs() < region_extent.x.abs();
    let block_y = y.abs() < region_extent.y.abs();
    block_x && block_y
}

/// Plans detour moves for a fixed screen and arm geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct DetourPlanner {
    pub evadability: Evadability,
    /// Screen centre in the arm frame.
    pub screen_center: StepVector,
    pub outside_distance: i64,
    pub y_side_offset: i64,
    pub step_threshold: i64,
    pub step_distance: i64,
}

impl DetourPlanner {
    /// Parking point outside the screen as seen from `position`.
    pub fn target(&self, position: StepVector) -> StepVector {
        StepVector::new(
            away_screen_length(position.x, self.screen_center.x, self.outside_distance),
            self.screen_center.y * 2 - self.y_side_offset,
        )
    }

    /// Single move to the parking point along the most convenient axis.
    pub fn full(&self, position: StepVector) -> DetourDecision {
        let rel = self.target(position) - position;
        match self.choose_axis(rel) {
            Some(Axis::X) => DetourDecision::Full(StepVector::new(rel.x, 0)),
            Some(Axis::Y) => DetourDecision::Full(StepVector::new(0, rel.y)),
            None => DetourDecision::BlockedImpossible,
        }
    }

    /// Next increment toward the parking point.
    ///
    /// While the remaining distance exceeds the step threshold the move stops
    /// `step_distance` short of the target; below it the remainder is taken at
    /// once.
    pub fn step(&self, position: StepVector) -> DetourDecision {
        let rel = self.target(position) - position;
        let Some(axis) = self.choose_axis(rel) else {
            return DetourDecision::BlockedImpossible;
        };

        let remaining = if self.evadability.x && self.evadability.y {
            rel.x.abs().min(rel.y.abs())
        } else {
            match axis {
                Axis::X => rel.x.abs(),
                Axis::Y => rel.y.abs(),
            }
        };
        let shortfall = if remaining > self.step_threshold {
            self.step_distance
        } else {
            0
        };

        let shorten = |d: i64| if d < 0 { d + shortfall } else { d - shortfall };
        match axis {
            Axis::X => DetourDecision::Step(StepVector::new(shorten(rel.x), 0)),
            Axis::Y => DetourDecision::Step(StepVector::new(0, shorten(rel.y))),
        }
    }

    fn choose_axis(&self, rel: StepVector) -> Option<Axis> {
        match (self.evadability.x, self.evadability.y) {
            (true, false) => Some(Axis::X),
            (false, true) => Some(Axis::Y),
            (true, true) if rel.x.abs() < rel.y.abs() => Some(Axis::X),
            (true, true) => Some(Axis::Y),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(x: bool, y: bool) -> DetourPlanner {
        DetourPlanner {
            evadability: Evadability { x, y },
            screen_center: StepVector::new(4000, 8000),
            outside_distance: 2000,
            y_side_offset: 1500,
            step_threshold: 4000,
            step_distance: 2000,
        }
    }

    #[test]
    fn test_evadability_boundary() {
        let range = Vector2::new(24000.0, 16800.0);
        let margin = Vector2::new(5600.0, 4000.0);
        let limit = Vector2::new(24000.0 - 5600.0, 16800.0 - 4000.0);

        let at_limit = Evadability::analyze(limit, range, margin);
        assert!(at_limit.x && at_limit.y);

        let over = Evadability::analyze(limit + Vector2::new(1.0, 1.0), range, margin);
        assert!(!over.x && !over.y);
        assert!(!over.any());

        // Sign of the extent does not matter.
        let mirrored = Evadability::analyze(-limit, -range, margin);
        assert!(mirrored.x && mirrored.y);
    }

    #[test]
    fn test_away_screen_length() {
        // Positive centre: leave through the far edge when past the middle.
        assert_eq!(away_screen_length(5000, 4000, 2000), 10000);
        assert_eq!(away_screen_length(1000, 4000, 2000), -2000);
        // Negative centre (mirrored mounting).
        assert_eq!(away_screen_length(-1000, -4000, 2000), -1000);
        assert_eq!(away_screen_length(-5000, -4000, 2000), -10000);
    }

    #[test]
    fn test_blocking_requires_both_axes() {
        let extent = Vector2::new(8000.0, 16000.0);
        assert!(is_blocking(StepVector::new(3000, 5000), extent));
        // Other side of the origin on X.
        assert!(!is_blocking(StepVector::new(-3000, 5000), extent));
        // Past the region on Y.
        assert!(!is_blocking(StepVector::new(3000, 17000), extent));
        // Exactly on the origin is not blocking.
        assert!(!is_blocking(StepVector::zeros(), extent));
    }

    #[test]
    fn test_full_detour_picks_shorter_axis() {
        let p = planner(true, true);
        // target = (-2000, 14500); rel = (-5000, 11500)
        assert_eq!(
            p.full(StepVector::new(3000, 3000)),
            DetourDecision::Full(StepVector::new(-5000, 0))
        );
        // target = (-2000, 14500); rel = (-3000, 1500)
        assert_eq!(
            p.full(StepVector::new(1000, 13000)),
            DetourDecision::Full(StepVector::new(0, 1500))
        );
    }

    #[test]
    fn test_full_detour_single_axis() {
        assert_eq!(
            planner(false, true).full(StepVector::new(3000, 3000)),
            DetourDecision::Full(StepVector::new(0, 11500))
        );
        assert_eq!(
            planner(true, false).full(StepVector::new(3000, 3000)),
            DetourDecision::Full(StepVector::new(-5000, 0))
        );
        assert_eq!(
            planner(false, false).full(StepVector::new(3000, 3000)),
            DetourDecision::BlockedImpossible
        );
    }

    #[test]
    fn test_step_detour_increments() {
        let p = planner(true, false);
        // rel.x = -5000 exceeds the threshold: stop 2000 short.
        assert_eq!(
            p.step(StepVector::new(3000, 3000)),
            DetourDecision::Step(StepVector::new(-3000, 0))
        );
        // rel.x = -3000 is within the threshold: take it all.
        assert_eq!(
            p.step(StepVector::new(1000, 3000)),
            DetourDecision::Step(StepVector::new(-3000, 0))
        );

        let p = planner(false, true);
        // rel.y = 11500 → 9500
        assert_eq!(
            p.step(StepVector::new(3000, 3000)),
            DetourDecision::Step(StepVector::new(0, 9500))
        );
        assert_eq!(planner(false, false).step(StepVector::zeros()), DetourDecision::BlockedImpossible);
    }

    #[test]
    fn test_step_detour_both_axes_uses_minimum_distance() {
        let p = planner(true, true);
        // rel = (-5000, 11500): min 5000 > threshold, X is shorter.
        assert_eq!(
            p.step(StepVector::new(3000, 3000)),
            DetourDecision::Step(StepVector::new(-3000, 0))
        );
        // rel = (-3000, 1500): min 1500 within threshold, Y is shorter.
        assert_eq!(
            p.step(StepVector::new(1000, 13000)),
            DetourDecision::Step(StepVector::new(0, 1500))
        );
    }

    #[test]
    fn test_repeated_steps_reach_the_outside() {
        let p = planner(true, false);
        let extent = Vector2::new(8000.0, 16000.0);
        let mut pos = StepVector::new(7000, 3000);
        let mut steps = 0;
        while is_blocking(pos, extent) {
            match p.step(pos) {
                DetourDecision::Step(delta) => pos += delta,
                other => panic!("unexpected decision {other:?}"),
            }
            steps += 1;
            assert!(steps < 10, "detour did not converge");
        }
        assert!(pos.x >= 8000 || pos.x <= 0);
    }

    #[test]
    fn test_steps_settle_on_target() {
        let p = planner(false, true);
        let mut pos = StepVector::new(3000, 3000);
        for _ in 0..5 {
            if let DetourDecision::Step(delta) = p.step(pos) {
                pos += delta;
            }
        }
        assert_eq!(pos, StepVector::new(3000, 14500));
        assert_eq!(p.step(pos), DetourDecision::Step(StepVector::zeros()));
    }
}
