//! Queue router: weighted primary/legacy choice per submission.
//!
//! The decision happens before id allocation so each id is bound to exactly
//! one queue, and it is recorded on the evaluation row as `route_tag`. The
//! router never sees user code.

use crucible_schemas::RouteTag;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Share routed to the primary queue, `[0, 1]`.
    pub primary_percentage: f64,
    /// Emergency rollback: everything to legacy, percentage ignored.
    pub force_legacy: bool,
    /// Optional backpressure spill: primary depth at or above this shifts
    /// traffic to legacy until the backlog drains.
    pub spill_threshold: Option<usize>,
}

impl RouterConfig {
    pub fn all_primary() -> Self {
        Self {
            primary_percentage: 1.0,
            force_legacy: false,
            spill_threshold: None,
        }
    }
}

pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config: RouterConfig {
                primary_percentage: config.primary_percentage.clamp(0.0, 1.0),
                ..config
            },
        }
    }

    /// Route one submission. `primary_depth` feeds the optional spill knob.
    pub fn route(&self, primary_depth: usize) -> RouteTag {
        self.route_with_roll(rand::thread_rng().gen::<f64>(), primary_depth)
    }

    /// Deterministic core: `roll` is uniform in `[0, 1)`.
    pub fn route_with_roll(&self, roll: f64, primary_depth: usize) -> RouteTag {
        if self.config.force_legacy {
            return RouteTag::Legacy;
        }
        if let Some(threshold) = self.config.spill_threshold {
            if primary_depth >= threshold {
                return RouteTag::Legacy;
            }
        }
        if roll < self.config.primary_percentage {
            RouteTag::Primary
        } else {
            RouteTag::Legacy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_boundaries() {
        let r = Router::new(RouterConfig {
            primary_percentage: 0.5,
            force_legacy: false,
            spill_threshold: None,
        });
        assert_eq!(r.route_with_roll(0.0, 0), RouteTag::Primary);
        assert_eq!(r.route_with_roll(0.49, 0), RouteTag::Primary);
        assert_eq!(r.route_with_roll(0.5, 0), RouteTag::Legacy);
        assert_eq!(r.route_with_roll(0.99, 0), RouteTag::Legacy);
    }

    #[test]
    fn zero_and_one_are_absolute() {
        let all = Router::new(RouterConfig::all_primary());
        assert_eq!(all.route_with_roll(0.999_999, 0), RouteTag::Primary);

        let none = Router::new(RouterConfig {
            primary_percentage: 0.0,
            force_legacy: false,
            spill_threshold: None,
        });
        assert_eq!(none.route_with_roll(0.0, 0), RouteTag::Legacy);
    }

    #[test]
    fn force_legacy_overrides_everything() {
        let r = Router::new(RouterConfig {
            primary_percentage: 1.0,
            force_legacy: true,
            spill_threshold: None,
        });
        assert_eq!(r.route_with_roll(0.0, 0), RouteTag::Legacy);
    }

    #[test]
    fn spill_threshold_sheds_to_legacy_under_backlog() {
        let r = Router::new(RouterConfig {
            primary_percentage: 1.0,
            force_legacy: false,
            spill_threshold: Some(10),
        });
        assert_eq!(r.route_with_roll(0.0, 9), RouteTag::Primary);
        assert_eq!(r.route_with_roll(0.0, 10), RouteTag::Legacy);
    }

    #[test]
    fn out_of_range_percentage_is_clamped() {
        let r = Router::new(RouterConfig {
            primary_percentage: 7.3,
            force_legacy: false,
            spill_threshold: None,
        });
        assert_eq!(r.route_with_roll(0.999, 0), RouteTag::Primary);
    }
}
