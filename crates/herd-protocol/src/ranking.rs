/// Relevance ranking — proximity and recency.
///
/// `score = exp(-alpha * distance_m) * exp(-beta * age_hours)`.
///
/// Ordering is done on the exponent (`-alpha * d - beta * h`) so that
/// posts whose score underflows to `0.0` a few kilometers out still keep
/// their relative order. Ties keep input order.
use chrono::{DateTime, Utc};

use crate::geo;
use crate::post::Post;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Ranking weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingConfig {
    /// Decay per meter of distance.
    pub alpha: f64,
    /// Decay per hour of age.
    pub beta: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            beta: 0.3,
        }
    }
}

/// A post with its relevance to the local position.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPost {
    pub post: Post,
    pub score: f64,
    /// Natural log of `score`; the sort key.
    pub log_score: f64,
    pub distance_m: f64,
    pub age_hours: f64,
}

impl RankedPost {
    pub fn distance_km(&self) -> f64 {
        self.distance_m / 1000.0
    }
}

/// Scores and orders posts, most relevant first.
#[derive(Debug, Clone, Default)]
pub struct RankingEngine {
    config: RankingConfig,
}

impl RankingEngine {
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Exponent of the score.
    ///
    /// Posts dated in the future (clock skew) are treated as brand new:
    /// age is clamped at zero so they cannot outrank a post made now.
    pub fn log_score(&self, distance_m: f64, age_hours: f64) -> f64 {
        let value = -self.config.alpha * distance_m - self.config.beta * age_hours.max(0.0);
        if value.is_nan() {
            f64::NEG_INFINITY
        } else {
            value
        }
    }

    pub fn score(&self, distance_m: f64, age_hours: f64) -> f64 {
        self.log_score(distance_m, age_hours).exp()
    }

    /// Rank against the current time.
    pub fn rank(&self, posts: Vec<Post>, latitude: f64, longitude: f64) -> Vec<RankedPost> {
        self.rank_at(posts, latitude, longitude, Utc::now())
    }

    /// Rank against an explicit clock.
    ///
    /// Posts with unparsable coordinates sort last.
    pub fn rank_at(
        &self,
        posts: Vec<Post>,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
    ) -> Vec<RankedPost> {
        let mut ranked: Vec<RankedPost> = posts
            .into_iter()
            .map(|post| {
                let distance_m = match post.coordinates() {
                    Some((lat, lon)) => geo::distance_m(latitude, longitude, lat, lon),
                    None => f64::INFINITY,
                };
                let age_hours = (now - post.created_at).num_milliseconds() as f64 / MS_PER_HOUR;
                let log_score = self.log_score(distance_m, age_hours);
                RankedPost {
                    post,
                    score: log_score.exp(),
                    log_score,
                    distance_m,
                    age_hours,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.log_score.total_cmp(&a.log_score));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn post(id: &str, lat: &str, lon: &str, hours_ago: i64) -> Post {
        let created = now() - Duration::hours(hours_ago);
        Post {
            id: id.into(),
            text: id.into(),
            latitude: lat.into(),
            longitude: lon.into(),
            public_key: String::new(),
            private_key: None,
            created_at: created,
            imported_at: created,
            signature: String::new(),
            raw: String::new(),
        }
    }

    fn ids(ranked: &[RankedPost]) -> Vec<&str> {
        ranked.iter().map(|r| r.post.id.as_str()).collect()
    }

    #[test]
    fn nearer_wins_at_equal_age() {
        let engine = RankingEngine::default();
        let ranked = engine.rank_at(
            vec![post("far", "40.001", "-74.0", 1), post("near", "40.0", "-74.0", 1)],
            40.0,
            -74.0,
            now(),
        );
        assert_eq!(ids(&ranked), vec!["near", "far"]);
    }

    #[test]
    fn newer_wins_at_equal_distance() {
        let engine = RankingEngine::default();
        let ranked = engine.rank_at(
            vec![post("old", "40.0", "-74.0", 5), post("new", "40.0", "-74.0", 1)],
            40.0,
            -74.0,
            now(),
        );
        assert_eq!(ids(&ranked), vec!["new", "old"]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn order_survives_score_underflow() {
        // 3 km and 4 km both underflow exp(); the exponent still orders them.
        let engine = RankingEngine::default();
        let ranked = engine.rank_at(
            vec![post("4km", "40.036", "-74.0", 0), post("3km", "40.027", "-74.0", 0)],
            40.0,
            -74.0,
            now(),
        );
        assert_eq!(ranked[0].score, 0.0);
        assert_eq!(ids(&ranked), vec!["3km", "4km"]);
    }

    #[test]
    fn ties_keep_input_order() {
        let engine = RankingEngine::default();
        let ranked = engine.rank_at(
            vec![post("a", "1", "1", 2), post("b", "1", "1", 2), post("c", "1", "1", 2)],
            1.0,
            1.0,
            now(),
        );
        assert_eq!(ids(&ranked), vec!["a", "b", "c"]);
    }

    #[test]
    fn future_posts_are_clamped_to_now() {
        let engine = RankingEngine::default();
        let ranked = engine.rank_at(
            vec![post("present", "0", "0", 0), post("future", "0", "0", -48)],
            0.0,
            0.0,
            now(),
        );
        assert_eq!(ids(&ranked), vec!["present", "future"]);
        assert_eq!(ranked[1].score, 1.0);
        assert!(ranked[1].age_hours < 0.0);
    }

    #[test]
    fn bad_coordinates_sort_last() {
        let engine = RankingEngine::default();
        let ranked = engine.rank_at(
            vec![post("broken", "north", "-74", 0), post("ok", "40.5", "-74.0", 100)],
            40.0,
            -74.0,
            now(),
        );
        assert_eq!(ids(&ranked), vec!["ok", "broken"]);
        assert!(ranked[1].distance_m.is_infinite());
    }

    #[test]
    fn distance_and_age_are_reported() {
        let engine = RankingEngine::new(RankingConfig { alpha: 0.0, beta: 0.3 });
        let ranked = engine.rank_at(vec![post("p", "41.0", "-74.0", 2)], 40.0, -74.0, now());
        assert!((ranked[0].distance_km() - 111.19).abs() < 0.1);
        assert!((ranked[0].age_hours - 2.0).abs() < 1e-9);
        assert!((ranked[0].score - (-0.6f64).exp()).abs() < 1e-12);
    }
}
