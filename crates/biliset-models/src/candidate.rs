//! Search candidates.

use crate::id::VideoId;

/// A video discovered by keyword search.
///
/// Candidates live in memory only: they are either dropped by a filter or
/// promoted into a [`crate::MetadataRecord`] by the metadata collector.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: VideoId,
    pub title: String,
    /// Duration in seconds, parsed from the search hit's textual duration.
    /// `None` when the remote sent something unparseable.
    pub duration_secs: Option<u64>,
    /// Publish time as a unix timestamp (seconds).
    pub pubdate: i64,
    pub uploader_id: i64,
    pub uploader_name: String,
    pub play_count: u64,
    pub like_count: u64,
    pub favorite_count: u64,
    pub coin_count: u64,
    /// The keyword this candidate was found under.
    pub keyword: String,
}

impl Candidate {
    /// Engagement score used by the optional quality filter:
    /// a weighted sum of counters normalized by play count.
    pub fn quality_score(&self, w_like: f64, w_coin: f64, w_fav: f64) -> f64 {
        let weighted = w_like * self.like_count as f64
            + w_coin * self.coin_count as f64
            + w_fav * self.favorite_count as f64;
        weighted / (self.play_count.max(1)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(play: u64, like: u64) -> Candidate {
        Candidate {
            id: VideoId::parse("BV1GJ411x7h7").unwrap(),
            title: "t".to_string(),
            duration_secs: Some(60),
            pubdate: 0,
            uploader_id: 1,
            uploader_name: "up".to_string(),
            play_count: play,
            like_count: like,
            favorite_count: 0,
            coin_count: 0,
            keyword: "kw".to_string(),
        }
    }

    #[test]
    fn test_quality_score_normalized_by_plays() {
        let c = candidate(1000, 100);
        let score = c.quality_score(1.0, 0.0, 0.0);
        assert!((score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_quality_score_zero_plays_does_not_divide_by_zero() {
        let c = candidate(0, 5);
        assert_eq!(c.quality_score(1.0, 0.0, 0.0), 5.0);
    }
}
