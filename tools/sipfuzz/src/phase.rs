use crate::errors::FuzzError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignPhase {
    Idle,
    Monitoring,
    Dispatch,
    Executing,
    Attributing,
    Recording,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTracker {
    pub phase: CampaignPhase,
    pub cases_dispatched: usize,
    pub cases_recorded: usize,
    pub current_case: Option<String>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: CampaignPhase::Idle,
            cases_dispatched: 0,
            cases_recorded: 0,
            current_case: None,
        }
    }
}

impl PhaseTracker {
    pub fn transition(&mut self, next: CampaignPhase) -> Result<(), FuzzError> {
        validate_phase_transition(self.phase, next)?;
        tracing::debug!(from = ?self.phase, to = ?next, "campaign phase");
        self.phase = next;
        Ok(())
    }

    pub fn begin_case(&mut self, case_id: &str) -> Result<(), FuzzError> {
        if self.phase != CampaignPhase::Dispatch {
            return Err(FuzzError::Phase(format!(
                "case {case_id} dispatched from {:?}",
                self.phase
            )));
        }
        self.transition(CampaignPhase::Executing)?;
        self.cases_dispatched += 1;
        self.current_case = Some(case_id.to_string());
        Ok(())
    }

    pub fn finish_case(&mut self) -> Result<(), FuzzError> {
        if self.phase != CampaignPhase::Recording {
            return Err(FuzzError::Phase(format!(
                "case finished from {:?}",
                self.phase
            )));
        }
        self.cases_recorded += 1;
        self.current_case = None;
        Ok(())
    }
}

pub fn validate_phase_transition(from: CampaignPhase, to: CampaignPhase) -> Result<(), FuzzError> {
    use CampaignPhase as P;

    let allowed = match from {
        P::Idle => matches!(to, P::Monitoring | P::Dispatch | P::Stopped),
        P::Monitoring => matches!(to, P::Dispatch | P::Stopped),
        P::Dispatch => matches!(to, P::Executing | P::Stopped),
        P::Executing => matches!(to, P::Attributing | P::Stopped),
        P::Attributing => matches!(to, P::Recording | P::Stopped),
        P::Recording => matches!(to, P::Dispatch | P::Stopped),
        P::Stopped => false,
    };

    if !allowed {
        return Err(FuzzError::Phase(format!("{from:?} -> {to:?}")));
    }
    Ok(())
}
