//! Annotation session stress scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// SIM-001: Continuous edits collapse into one write per stream
    AutosaveStorm,

    /// SIM-002: Half of all writes fail, the scene still ends persisted
    FlakyStorage,

    /// SIM-003: Interpolated tracks follow ground truth on every frame
    TrackSweep,

    /// SIM-004: Every projected point is found again by hover
    ProjectionSweep,

    /// SIM-005: Long edit chain against the bounded undo stack
    UndoMarathon,

    /// SIM-006: Folder switches while saves are in flight
    SceneSwitch,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::AutosaveStorm,
            ScenarioId::FlakyStorage,
            ScenarioId::TrackSweep,
            ScenarioId::ProjectionSweep,
            ScenarioId::UndoMarathon,
            ScenarioId::SceneSwitch,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::AutosaveStorm => "autosave_storm",
            ScenarioId::FlakyStorage => "flaky_storage",
            ScenarioId::TrackSweep => "track_sweep",
            ScenarioId::ProjectionSweep => "projection_sweep",
            ScenarioId::UndoMarathon => "undo_marathon",
            ScenarioId::SceneSwitch => "scene_switch",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::AutosaveStorm => "Edits every tick for 3s, expect exactly one write per stream",
            ScenarioId::FlakyStorage => "50% write failures with slow storage, expect a clean persisted end state",
            ScenarioId::TrackSweep => "Two keyframes per object, interpolation and membership match truth",
            ScenarioId::ProjectionSweep => "Hover at each projected pixel returns a point at distance zero",
            ScenarioId::UndoMarathon => "25 commits, 10 undos, then the stack is empty and redo restores",
            ScenarioId::SceneSwitch => "Switch folders mid-save, stale results dropped, data persisted",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "autosave_storm" | "autosavestorm" | "sim-001" => Ok(ScenarioId::AutosaveStorm),
            "flaky_storage" | "flakystorage" | "sim-002" => Ok(ScenarioId::FlakyStorage),
            "track_sweep" | "tracksweep" | "sim-003" => Ok(ScenarioId::TrackSweep),
            "projection_sweep" | "projectionsweep" | "sim-004" => Ok(ScenarioId::ProjectionSweep),
            "undo_marathon" | "undomarathon" | "sim-005" => Ok(ScenarioId::UndoMarathon),
            "scene_switch" | "sceneswitch" | "sim-006" => Ok(ScenarioId::SceneSwitch),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
            assert_eq!(id.to_string(), id.name());
        }
        assert_eq!("SIM-004".parse::<ScenarioId>(), Ok(ScenarioId::ProjectionSweep));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
