//! Score formulas.
//!
//! The five composite scores are SQL expressions evaluated in-flight while
//! rows stream out of the source; the overall score is a weighted
//! combination recomputed after a run, with one weighting for the all-time
//! table and another for the periodic snapshots.

/// Ranking window a weighting applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Alltime,
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    /// Suffix used by snapshot table names (`player_daily`, …).
    pub fn suffix(self) -> &'static str {
        match self {
            Period::Alltime => "alltime",
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }

    /// Window length in days; `None` for the all-time table.
    pub fn days(self) -> Option<i64> {
        match self {
            Period::Alltime => None,
            Period::Daily => Some(1),
            Period::Weekly => Some(7),
            Period::Monthly => Some(30),
        }
    }
}

/// `(column, SQL expression)` pairs for the five composite scores.
pub fn composite_formulas() -> &'static [(&'static str, &'static str)] {
    &[
        (
            "score_stats",
            "(`cheese_gathered` + `first` * 3) \
             / POWER(GREATEST(`round_played`, 1), 0.25)",
        ),
        (
            "score_shaman",
            "(`shaman_cheese` * 0.05 + `saved_mice` * 0.2 \
             + `saved_mice_hard`*0.35 + `saved_mice_divine`*0.5) \
             / POWER(GREATEST(`round_played`, 1), 0.25)",
        ),
        (
            "score_survivor",
            "(1.6 * `survivor_survivor_count` + 0.8 * `survivor_mouse_killed`) \
             / POWER(GREATEST(`survivor_shaman_count` * `survivor_round_played`, 1), 0.25)",
        ),
        (
            "score_racing",
            "(2 * `racing_first` + `racing_podium`) \
             / POWER(GREATEST(`racing_round_played` * `racing_finished_map`, 1), 0.25)",
        ),
        (
            "score_defilante",
            "`defilante_points` / \
             POWER(GREATEST(`defilante_round_played` * `defilante_finished_map`, 1), 0.25)",
        ),
    ]
}

/// The weighted overall-score expression for a period.
pub fn overall_formula(period: Period) -> String {
    let (stats, shaman, survivor, racing, defilante) = match period {
        Period::Alltime => (35.564, 24.956, 1.580, 0.861, 2.851),
        // The three periodic snapshots share one weighting.
        Period::Daily | Period::Weekly | Period::Monthly => (0.494, 0.311, 0.056, 0.074, 0.333),
    };
    format!(
        "(`score_stats` / {stats} + \
         `score_shaman` / {shaman} + \
         `score_survivor` / {survivor} + \
         `score_racing` / {racing} + \
         `score_defilante` / {defilante})"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_set_is_complete() {
        let columns: Vec<&str> = composite_formulas().iter().map(|(col, _)| *col).collect();
        assert_eq!(
            columns,
            vec![
                "score_stats",
                "score_shaman",
                "score_survivor",
                "score_racing",
                "score_defilante",
            ]
        );
    }

    #[test]
    fn overall_weights_differ_per_window() {
        let alltime = overall_formula(Period::Alltime);
        let daily = overall_formula(Period::Daily);
        assert!(alltime.contains("35.564"));
        assert!(daily.contains("0.494"));
        assert_eq!(daily, overall_formula(Period::Weekly));
        assert_eq!(daily, overall_formula(Period::Monthly));
    }

    #[test]
    fn period_windows() {
        assert_eq!(Period::Daily.days(), Some(1));
        assert_eq!(Period::Weekly.days(), Some(7));
        assert_eq!(Period::Monthly.days(), Some(30));
        assert_eq!(Period::Alltime.days(), None);
    }
}
