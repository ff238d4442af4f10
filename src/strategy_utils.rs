use crate::models::Direction;

pub const NSE_TICK_SIZE: f64 = 0.05;

/// Rounds a price up onto the exchange's 0.05 tick grid.
pub fn round_to_tick(price: f64) -> f64 {
    let cents = (price * 100.0).round() / 100.0;
    let ticks = (cents / NSE_TICK_SIZE - 1e-9).ceil();
    ((ticks * NSE_TICK_SIZE) * 100.0).round() / 100.0
}

/// Long and short breakout levels `percentage`% either side of `reference`.
pub fn breakout_levels(reference: f64, percentage: f64) -> (f64, f64) {
    let offset = reference * percentage / 100.0;
    (
        round_to_tick(reference + offset),
        round_to_tick(reference - offset),
    )
}

/// Stop loss `percentage`% away from `entry` on the losing side.
pub fn stop_loss_from_percentage(direction: Direction, entry: f64, percentage: f64) -> f64 {
    let offset = entry * percentage / 100.0;
    match direction {
        Direction::Long => round_to_tick(entry - offset),
        Direction::Short => round_to_tick(entry + offset),
    }
}

pub fn target_from_percentage(direction: Direction, entry: f64, percentage: f64) -> f64 {
    let offset = entry * percentage / 100.0;
    match direction {
        Direction::Long => round_to_tick(entry + offset),
        Direction::Short => round_to_tick(entry - offset),
    }
}

/// Step trailing stop: every full `step` of favourable movement from `entry`
/// moves the initial stop one `step` closer. Returns 0 while nothing is earned.
pub fn step_trailing_stop(
    direction: Direction,
    entry: f64,
    initial_stop_loss: f64,
    cmp: f64,
    step: f64,
) -> f64 {
    if step <= 0.0 || entry <= 0.0 || cmp <= 0.0 || initial_stop_loss <= 0.0 {
        return 0.0;
    }
    let profit = match direction {
        Direction::Long => cmp - entry,
        Direction::Short => entry - cmp,
    };
    let steps = (profit / step).floor();
    if steps < 1.0 {
        return 0.0;
    }
    match direction {
        Direction::Long => initial_stop_loss + steps * step,
        Direction::Short => initial_stop_loss - steps * step,
    }
}

/// True when `candidate` protects more than `current` for the given side.
pub fn is_tighter_stop(direction: Direction, current: f64, candidate: f64) -> bool {
    if candidate <= 0.0 {
        return false;
    }
    match direction {
        Direction::Long => candidate > current,
        Direction::Short => current <= 0.0 || candidate < current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_round_up_to_the_tick_grid() {
        assert_eq!(round_to_tick(100.0), 100.0);
        assert_eq!(round_to_tick(100.01), 100.05);
        assert_eq!(round_to_tick(100.05), 100.05);
        assert_eq!(round_to_tick(502.504), 502.5);
        assert_eq!(round_to_tick(497.51), 497.55);
    }

    #[test]
    fn breakout_levels_straddle_the_reference() {
        let (long, short) = breakout_levels(500.0, 0.5);
        assert_eq!(long, 502.5);
        assert_eq!(short, 497.5);
    }

    #[test]
    fn stop_and_target_sit_on_the_right_side() {
        assert_eq!(stop_loss_from_percentage(Direction::Long, 500.0, 1.0), 495.0);
        assert_eq!(stop_loss_from_percentage(Direction::Short, 500.0, 1.0), 505.0);
        assert_eq!(target_from_percentage(Direction::Long, 500.0, 2.0), 510.0);
        assert_eq!(target_from_percentage(Direction::Short, 500.0, 2.0), 490.0);
    }

    #[test]
    fn step_trail_moves_in_whole_steps() {
        assert_eq!(step_trailing_stop(Direction::Short, 200.0, 220.0, 197.0, 5.0), 0.0);
        assert_eq!(step_trailing_stop(Direction::Short, 200.0, 220.0, 194.0, 5.0), 215.0);
        assert_eq!(step_trailing_stop(Direction::Short, 200.0, 220.0, 189.0, 5.0), 210.0);
        assert_eq!(step_trailing_stop(Direction::Long, 100.0, 95.0, 111.0, 5.0), 105.0);
    }

    #[test]
    fn tighter_stop_depends_on_direction() {
        assert!(is_tighter_stop(Direction::Long, 95.0, 96.0));
        assert!(!is_tighter_stop(Direction::Long, 95.0, 94.0));
        assert!(is_tighter_stop(Direction::Short, 505.0, 504.0));
        assert!(!is_tighter_stop(Direction::Short, 505.0, 506.0));
        assert!(!is_tighter_stop(Direction::Short, 505.0, 0.0));
    }
}
