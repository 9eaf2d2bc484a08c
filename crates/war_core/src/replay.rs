//! Replay and post-battle analysis over recorded event logs.
//!
//! A replay never touches live battles: it only re-emits logged events
//! with their recorded relative timing, optionally sped up or slowed down.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::battle::{BattleEvent, BattleResult, TacticalEvent, TacticalEventKind};
use crate::error::{Result, WarError};

/// Replay file format version for compatibility.
pub const REPLAY_VERSION: u32 = 1;

/// On-disk replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplayFile {
    version: u32,
    events: Vec<BattleEvent>,
}

/// Plays back a recorded event log.
#[derive(Debug, Clone, Default)]
pub struct BattleReplayer {
    events: Vec<BattleEvent>,
}

impl BattleReplayer {
    /// Replayer over `events`, put in timestamp order (ties by sequence).
    #[must_use]
    pub fn new(mut events: Vec<BattleEvent>) -> Self {
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Self { events }
    }

    /// Events in playback order.
    #[must_use]
    pub fn events(&self) -> &[BattleEvent] {
        &self.events
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether there is nothing to play.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Battle time covered by the log.
    #[must_use]
    pub fn span(&self) -> Duration {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.timestamp.saturating_sub(first.timestamp),
            _ => Duration::ZERO,
        }
    }

    /// Lazy `(delay, event)` pairs: each delay is the gap to the previous
    /// event divided by `speed`, saturating at [`Duration::MAX`]. The first
    /// delay is zero.
    pub fn schedule(&self, speed: f64) -> Result<Schedule<'_>> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(WarError::InvalidArgument(format!(
                "replay speed must be positive, got {speed}"
            )));
        }
        Ok(Schedule {
            events: self.events.iter(),
            previous: None,
            speed,
        })
    }

    /// Stream the events, sleeping the scaled delays. Every call starts
    /// from the first event.
    pub fn play(&self, speed: f64) -> Result<impl Stream<Item = BattleEvent> + Send + '_> {
        let schedule = self.schedule(speed)?;
        Ok(stream::iter(schedule).then(|(delay, event)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            event.clone()
        }))
    }

    /// Write the log to a RON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = ReplayFile {
            version: REPLAY_VERSION,
            events: self.events.clone(),
        };
        let text = ron::ser::to_string_pretty(&file, ron::ser::PrettyConfig::default()).map_err(
            |e| WarError::DataParse {
                source_name: path.display().to_string(),
                message: e.to_string(),
            },
        )?;
        std::fs::write(path, text).map_err(|e| WarError::DataParse {
            source_name: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Read a log written by [`BattleReplayer::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let parse_error = |message: String| WarError::DataParse {
            source_name: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| parse_error(e.to_string()))?;
        let file: ReplayFile = ron::from_str(&text).map_err(|e| parse_error(e.to_string()))?;
        if file.version != REPLAY_VERSION {
            return Err(parse_error(format!(
                "replay version mismatch: expected {REPLAY_VERSION}, got {}",
                file.version
            )));
        }
        Ok(Self::new(file.events))
    }
}

/// Iterator returned by [`BattleReplayer::schedule`].
#[derive(Debug, Clone)]
pub struct Schedule<'a> {
    events: std::slice::Iter<'a, BattleEvent>,
    previous: Option<Duration>,
    speed: f64,
}

impl<'a> Iterator for Schedule<'a> {
    type Item = (Duration, &'a BattleEvent);

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.next()?;
        let gap = self
            .previous
            .map_or(Duration::ZERO, |prev| event.timestamp.saturating_sub(prev));
        self.previous = Some(event.timestamp);
        let delay =
            Duration::try_from_secs_f64(gap.as_secs_f64() / self.speed).unwrap_or(Duration::MAX);
        Some((delay, event))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.events.size_hint()
    }
}

impl ExactSizeIterator for Schedule<'_> {}

/// Post-battle report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleAnalysis {
    /// One-line verdict.
    pub assessment: String,
    /// Damage dealt per unit lost, scaled by accuracy.
    pub performance_scores: BTreeMap<String, f64>,
    /// Observations per faction.
    pub strengths_weaknesses: BTreeMap<String, Vec<String>>,
    /// Tactical events with the most impact, highest first.
    pub critical_moments: Vec<TacticalEvent>,
    /// Suggestions for the next fight.
    pub recommendations: Vec<String>,
}

const CRITICAL_MOMENTS: usize = 5;

/// Score every faction and summarize the battle.
#[must_use]
pub fn analyze_battle(result: &BattleResult) -> BattleAnalysis {
    let stats = &result.statistics;
    let factions: Vec<&String> = result.survivors.keys().collect();

    let mut performance_scores = BTreeMap::new();
    let mut strengths_weaknesses = BTreeMap::new();
    let mut recommendations = Vec::new();

    for faction in &factions {
        let faction = faction.as_str();
        let accuracy = stats.accuracy(faction);
        let score = stats.efficiency(faction) * (0.5 + accuracy / 2.0);
        performance_scores.insert(faction.to_owned(), score);

        let lost = stats.casualties(faction);
        let survivors = result.survivors.get(faction).copied().unwrap_or(0);
        let mut notes = Vec::new();
        if accuracy >= 0.8 {
            notes.push(format!("accurate fire ({:.0}% hits)", accuracy * 100.0));
        } else if stats.shots_fired.get(faction).copied().unwrap_or(0) > 0 && accuracy < 0.5 {
            notes.push(format!("poor accuracy ({:.0}% hits)", accuracy * 100.0));
        }
        if lost == 0 {
            notes.push("no losses".to_owned());
        } else if survivors == 0 {
            notes.push("wiped out".to_owned());
            recommendations.push(format!(
                "{faction}: avoid committing every unit to a single engagement"
            ));
        }
        if stats.has_tactical(TacticalEventKind::FormationBreak, faction) {
            notes.push("formation broke under pressure".to_owned());
            recommendations.push(format!("{faction}: keep units together and retreat earlier"));
        }
        if stats.damage_dealt.get(faction).copied().unwrap_or(0) == 0 {
            recommendations.push(format!("{faction}: close to weapon range before engaging"));
        }
        strengths_weaknesses.insert(faction.to_owned(), notes);
    }

    let unresolved = result.objectives.iter().filter(|s| !s.is_resolved()).count();
    if unresolved > 0 {
        recommendations.push(format!("{unresolved} objective(s) were left unresolved"));
    }

    let mut critical_moments = stats.tactical_events.clone();
    critical_moments.sort_by(|a, b| {
        b.impact
            .total_cmp(&a.impact)
            .then(a.timestamp.cmp(&b.timestamp))
    });
    critical_moments.truncate(CRITICAL_MOMENTS);

    let assessment = match &result.winner {
        Some(winner) => {
            let margin = result.survivors.get(winner).copied().unwrap_or(0);
            let total: u32 = result.survivors.values().sum::<u32>()
                + result.casualties.get(winner).copied().unwrap_or(0);
            let kind = if total > 0 && margin * 2 > total {
                "decisive"
            } else {
                "narrow"
            };
            format!(
                "{kind} victory for {winner} after {:.1}s ({})",
                result.duration.as_secs_f64(),
                result.reason
            )
        }
        None => format!(
            "draw after {:.1}s ({})",
            result.duration.as_secs_f64(),
            result.reason
        ),
    };

    BattleAnalysis {
        assessment,
        performance_scores,
        strengths_weaknesses,
        critical_moments,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::{BattleEventKind, BattleStatistics};

    fn event(seq: u64, millis: u64) -> BattleEvent {
        let mut event = BattleEvent::new(BattleEventKind::Custom, "b", Duration::from_millis(millis));
        event.seq = seq;
        event
    }

    fn replayer() -> BattleReplayer {
        BattleReplayer::new(vec![event(3, 1000), event(1, 0), event(2, 400), event(4, 1000)])
    }

    #[test]
    fn test_schedule_scales_gaps() {
        let replayer = replayer();
        let delays: Vec<_> = replayer
            .schedule(2.0)
            .unwrap()
            .map(|(delay, e)| (delay, e.seq))
            .collect();
        assert_eq!(
            delays,
            [
                (Duration::ZERO, 1),
                (Duration::from_millis(200), 2),
                (Duration::from_millis(300), 3),
                (Duration::ZERO, 4),
            ]
        );
        assert_eq!(replayer.span(), Duration::from_secs(1));
    }

    #[test]
    fn test_schedule_rejects_bad_speed() {
        let replayer = replayer();
        assert!(replayer.schedule(0.0).is_err());
        assert!(replayer.schedule(-1.0).is_err());
        assert!(replayer.schedule(f64::NAN).is_err());
        assert!(replayer.schedule(f64::INFINITY).is_err());
    }

    #[test]
    fn test_tiny_speed_saturates_delays() {
        let replayer = replayer();
        for speed in [1e-300, f64::MIN_POSITIVE] {
            let delays: Vec<_> = replayer.schedule(speed).unwrap().map(|(delay, _)| delay).collect();
            assert_eq!(delays, [Duration::ZERO, Duration::MAX, Duration::MAX, Duration::ZERO]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_takes_scaled_time_and_restarts() {
        let replayer = replayer();
        let start = tokio::time::Instant::now();
        let seqs: Vec<_> = replayer.play(4.0).unwrap().map(|e| e.seq).collect().await;
        assert_eq!(seqs, [1, 2, 3, 4]);
        assert_eq!(start.elapsed(), Duration::from_millis(250));

        let again: Vec<_> = replayer.play(1.0).unwrap().map(|e| e.seq).collect().await;
        assert_eq!(again, seqs);
    }

    #[test]
    fn test_analysis_scores_and_assessment() {
        let mut statistics = BattleStatistics::default();
        statistics.damage_dealt.insert("a".into(), 100);
        statistics.shots_fired.insert("a".into(), 10);
        statistics.hits.insert("a".into(), 10);
        statistics
            .units_lost
            .insert("b".into(), BTreeMap::from([(crate::unit_kind::UnitKind::Zergling, 3)]));
        statistics.tactical_events.push(TacticalEvent {
            kind: TacticalEventKind::FormationBreak,
            timestamp: Duration::from_secs(2),
            faction: "b".into(),
            description: "b broke".into(),
            impact: 0.5,
        });
        let result = BattleResult {
            battle_id: "x".into(),
            winner: Some("a".into()),
            duration: Duration::from_secs(12),
            casualties: BTreeMap::from([("a".into(), 0), ("b".into(), 3)]),
            survivors: BTreeMap::from([("a".into(), 2), ("b".into(), 0)]),
            statistics,
            objectives: Vec::new(),
            events: Vec::new(),
            reason: "b is the last faction standing".into(),
        };

        let analysis = analyze_battle(&result);
        assert!((analysis.performance_scores["a"] - 100.0).abs() < 1e-9);
        assert!(analysis.performance_scores["b"].abs() < 1e-9);
        assert!(analysis.assessment.starts_with("decisive victory for a"));
        assert!(analysis.strengths_weaknesses["a"].contains(&"no losses".to_owned()));
        assert!(analysis.strengths_weaknesses["b"].contains(&"wiped out".to_owned()));
        assert_eq!(analysis.critical_moments.len(), 1);
        assert!(analysis.recommendations.iter().any(|r| r.starts_with("b:")));
    }
}
