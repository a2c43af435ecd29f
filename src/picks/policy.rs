//! Enqueue policy: which stored games deserve a pick job right now.

use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::db::models::{EnqueueOutcome, Game, GameStatus, League};
use crate::db::Database;
use crate::ingestion::day_bounds;

/// `now` lies in `[start - window, start]`, both ends inclusive.
pub fn in_pregame_window(start: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    start - window <= now && now <= start
}

pub fn is_due(game: &Game, now: DateTime<Utc>, window: Duration) -> bool {
    game.status == GameStatus::Scheduled && in_pregame_window(game.start_time, now, window)
}

/// Enqueue a job for every due game in `games`. Returns how many were created.
pub fn enqueue_due(db: &Database, games: &[Game], now: DateTime<Utc>, window: Duration) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut created = 0;

    for game in games.iter().filter(|g| is_due(g, now, window)) {
        if !seen.insert(game.id) {
            continue;
        }
        match db.enqueue_if_absent(game)? {
            EnqueueOutcome::Created => {
                info!(
                    "📥 Enqueued pick job for {} #{}: {} vs {} (starts {})",
                    game.league, game.id, game.home_team, game.away_team, game.start_time
                );
                created += 1;
            }
            outcome => debug!("Game #{} not enqueued: {:?}", game.id, outcome),
        }
    }

    Ok(created)
}

/// Stored games whose pregame window is open at `now`, whatever date they
/// were ingested under.
pub fn games_in_window(db: &Database, leagues: &[League], now: DateTime<Utc>, window: Duration) -> Result<Vec<Game>> {
    let games = db.list_games_starting_between(now, now + window + Duration::seconds(1), leagues)?;
    Ok(games.into_iter().filter(|g| is_due(g, now, window)).collect())
}

/// Apply the policy to every stored game on `date` (a day in `offset`).
pub fn enqueue_for_date(
    db: &Database,
    date: NaiveDate,
    leagues: &[League],
    offset: FixedOffset,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<usize> {
    let (from, to) = day_bounds(date, offset);
    let games = db.list_games_starting_between(from, to, leagues)?;
    enqueue_due(db, &games, now, window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::JobState;
    use crate::db::test_support::scoreboard_game;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 22, 0, 0).unwrap()
    }

    fn stored(db: &Database, id: &str, start: DateTime<Utc>, status: GameStatus) -> Game {
        db.upsert_game(&scoreboard_game(League::Nba, id, start, status))
            .unwrap()
            .0
    }

    #[test]
    fn test_window_edges_are_inclusive() {
        let window = Duration::hours(2);
        let start = now() + window;
        assert!(in_pregame_window(start, now(), window));
        assert!(in_pregame_window(now(), now(), window));
        assert!(!in_pregame_window(start + Duration::seconds(1), now(), window));
        assert!(!in_pregame_window(now() - Duration::seconds(1), now(), window));
    }

    #[test]
    fn test_enqueue_due_applies_window_and_status() {
        let db = Database::open_in_memory().unwrap();
        let window = Duration::hours(2);
        let soon = stored(&db, "soon", now() + Duration::minutes(90), GameStatus::Scheduled);
        let later = stored(&db, "later", now() + Duration::hours(3), GameStatus::Scheduled);
        let started = stored(&db, "started", now() - Duration::minutes(10), GameStatus::Scheduled);
        let done = stored(&db, "done", now() + Duration::minutes(30), GameStatus::Final);

        let games = vec![soon.clone(), later.clone(), started.clone(), done.clone()];
        assert_eq!(enqueue_due(&db, &games, now(), window).unwrap(), 1);

        assert_eq!(db.jobs_for_game(soon.id).unwrap()[0].state, JobState::Pending);
        assert!(db.jobs_for_game(later.id).unwrap().is_empty());
        assert!(db.jobs_for_game(started.id).unwrap().is_empty());
        assert!(db.jobs_for_game(done.id).unwrap().is_empty());

        // Re-evaluating the same cycle creates nothing new
        assert_eq!(enqueue_due(&db, &games, now(), window).unwrap(), 0);
    }

    #[test]
    fn test_game_becomes_due_as_time_passes() {
        let db = Database::open_in_memory().unwrap();
        let window = Duration::hours(2);
        let game = stored(&db, "g", now() + Duration::hours(3), GameStatus::Scheduled);

        assert_eq!(enqueue_due(&db, &[game.clone()], now(), window).unwrap(), 0);
        let later = now() + Duration::hours(1) + Duration::minutes(5);
        assert_eq!(enqueue_due(&db, &[game], later, window).unwrap(), 1);
    }

    #[test]
    fn test_games_in_window_and_enqueue_for_date() {
        let db = Database::open_in_memory().unwrap();
        let window = Duration::hours(2);
        stored(&db, "a", now() + Duration::minutes(45), GameStatus::Scheduled);
        stored(&db, "b", now() + Duration::hours(5), GameStatus::Scheduled);
        stored(&db, "c", now() + Duration::minutes(20), GameStatus::Postponed);

        let due = games_in_window(&db, &[League::Nba], now(), window).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].external_id, "a");
        assert!(games_in_window(&db, &[League::Nhl], now(), window).unwrap().is_empty());

        let utc = FixedOffset::east_opt(0).unwrap();
        let date = now().date_naive();
        assert_eq!(enqueue_for_date(&db, date, &[], utc, now(), window).unwrap(), 1);
        assert_eq!(enqueue_for_date(&db, date, &[], utc, now(), window).unwrap(), 0);
    }
}
