use serde::{Deserialize, Serialize};

/// What to do with a trigger whose fire time slipped past the misfire threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Let the schedule kind pick (see `ScheduleKind::smart_misfire`).
    #[default]
    Smart,
    /// Never treat the trigger as misfired; every missed time fires in turn.
    IgnoreMisfirePolicy,
    /// Fire once immediately, then continue with the regular schedule.
    FireNow,
    /// Skip every missed fire time and wait for the next one after now.
    DoNothing,
}

impl std::fmt::Display for MisfireInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MisfireInstruction::Smart => "smart",
            MisfireInstruction::IgnoreMisfirePolicy => "ignore_misfire_policy",
            MisfireInstruction::FireNow => "fire_now",
            MisfireInstruction::DoNothing => "do_nothing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MisfireInstruction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "smart" => Ok(MisfireInstruction::Smart),
            "ignore_misfire_policy" => Ok(MisfireInstruction::IgnoreMisfirePolicy),
            "fire_now" => Ok(MisfireInstruction::FireNow),
            "do_nothing" => Ok(MisfireInstruction::DoNothing),
            other => Err(format!("unknown misfire instruction: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_smart() {
        assert_eq!(MisfireInstruction::default(), MisfireInstruction::Smart);
    }

    #[test]
    fn stored_names_parse() {
        assert_eq!(
            "fire_now".parse::<MisfireInstruction>(),
            Ok(MisfireInstruction::FireNow)
        );
        assert!("later".parse::<MisfireInstruction>().is_err());
    }
}
