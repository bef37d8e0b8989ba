use crate::math::normalize_heading;

/// Turns the absolute heading of a link into a label relative to where the
/// agent is currently facing, e.g. `front-right 30°` or `left`.
///
/// The cardinal labels (front/right/back/left) are only used for exact
/// quarter-turn deltas; everything else carries an integer degree offset from
/// the nearest forward/backward axis.
pub fn relative_direction(agent_heading: f64, link_heading: f64) -> String {
    let delta = normalize_heading(link_heading - agent_heading);

    if delta == 0. {
        "front".to_string()
    } else if delta < 90. {
        format!("front-right {}°", round_deg(delta))
    } else if delta == 90. {
        "right".to_string()
    } else if delta < 180. {
        format!("right-back {}°", round_deg(delta - 90.))
    } else if delta == 180. {
        "back".to_string()
    } else if delta < 270. {
        format!("left-back {}°", round_deg(270. - delta))
    } else if delta == 270. {
        "left".to_string()
    } else {
        format!("front-left {}°", round_deg(360. - delta))
    }
}

/// Round half-away-from-zero to whole degrees.
#[inline]
fn round_deg(deg: f64) -> i64 {
    deg.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinals_have_no_angle() {
        assert_eq!(relative_direction(0., 0.), "front");
        assert_eq!(relative_direction(0., 90.), "right");
        assert_eq!(relative_direction(0., 180.), "back");
        assert_eq!(relative_direction(0., 270.), "left");
        // cardinal deltas with a rotated agent
        assert_eq!(relative_direction(45., 135.), "right");
        assert_eq!(relative_direction(300., 120.), "back");
    }

    #[test]
    fn test_open_cases_match_formula() {
        assert_eq!(relative_direction(0., 30.), "front-right 30°");
        assert_eq!(relative_direction(0., 100.), "right-back 10°");
        assert_eq!(relative_direction(0., 200.), "left-back 70°");
        assert_eq!(relative_direction(0., 300.), "front-left 60°");
    }

    #[test]
    fn test_wraparound() {
        // link heading 10 with agent facing 350 is 20 to the right
        assert_eq!(relative_direction(350., 10.), "front-right 20°");
        // the other way around is 20 to the left
        assert_eq!(relative_direction(10., 350.), "front-left 20°");
    }

    #[test]
    fn test_rounding_is_half_away_from_zero() {
        assert_eq!(relative_direction(0., 29.5), "front-right 30°");
        assert_eq!(relative_direction(0., 29.4), "front-right 29°");
        assert_eq!(relative_direction(0., 330.5), "front-left 30°");
    }

    #[test]
    fn test_every_delta_is_labelled() {
        for tenth in 0..3600 {
            let link = tenth as f64 / 10.;
            let label = relative_direction(0., link);
            assert!(!label.is_empty());
        }
    }
}
