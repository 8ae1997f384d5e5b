// Pipeline Phase Machine
//
// Tracks the coarse lifecycle of a pipeline run from its first input
// line to its final checkpoint. Pure and side-effect free.

/// High-level lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Nothing read yet.
    Idle,

    /// Reading and buffering input.
    Receiving,

    /// At least one flush is in flight while input continues.
    Flushing,

    /// Input is over; remaining buffers are being written.
    Draining,

    /// Every stream is drained and the final state is out.
    Terminated,
}

/// Something that happened to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    InputReceived,
    FlushStarted,
    FlushFinished,
    /// End of input or a shutdown request.
    InputExhausted,
    Drained,
}

/// Errors produced during phase transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal phase transition: {0}")]
    IllegalTransition(String),
}

/// Stateful reducer for run events.
#[derive(Debug)]
pub struct PhaseMachine {
    phase: PipelinePhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: PipelinePhase::Idle,
        }
    }

    /// Apply a single event.
    pub fn apply(&mut self, event: PhaseEvent) -> Result<(), StateError> {
        use PhaseEvent::*;
        use PipelinePhase::*;

        self.phase = match (self.phase, event) {
            (Idle | Receiving, InputReceived) => Receiving,
            (Flushing, InputReceived) => Flushing,

            (Receiving | Flushing, FlushStarted) => Flushing,
            (Flushing, FlushFinished) => Receiving,

            // Input can end mid-flush, or before anything arrived
            (Idle | Receiving | Flushing, InputExhausted) => Draining,

            // Drain flushes do not leave the phase
            (Draining, FlushStarted | FlushFinished) => Draining,
            (Draining, Drained) => Terminated,

            (phase, event) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {:?} while {:?}",
                    event, phase
                )))
            }
        };

        Ok(())
    }

    pub fn current(&self) -> PipelinePhase {
        self.phase
    }

    pub fn is_accepting_input(&self) -> bool {
        matches!(
            self.phase,
            PipelinePhase::Idle | PipelinePhase::Receiving | PipelinePhase::Flushing
        )
    }
}
