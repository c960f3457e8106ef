use models::node::{DrainGrant, DrainRequest};

/// The action required to advance a node's drain handshake, derived purely from the two
/// annotation values. Side effects and admission checks belong to the coordinator; keeping this
/// a pure function makes the handshake testable without an orchestrator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transition {
    /// Both sides are idle; the node must be schedulable.
    EnsureSchedulable,
    /// The agent asked for a drain and no grant is held; subject to the pool budget.
    RequestAdmission,
    /// A grant is held; cordon, run platform hooks, and drive the drainer forward.
    ContinueDrain,
    /// The drain has completed; hold the grant until the agent releases the node.
    HoldComplete,
    /// The agent released the node; unwind hooks, uncordon, and idle the grant.
    ReturnToIdle,
}

/// Determines the coordinator's next move for one node.
///
/// Grants only ever advance `Idle → Draining[/DrainMcpPaused] → DrainComplete` within a cycle
/// and return to `Idle` when the request side lets go, no matter how far the drain had
/// progressed.
pub fn determine_transition(request: DrainRequest, grant: DrainGrant) -> Transition {
    if request.wants_drain() {
        match grant {
            DrainGrant::Idle => Transition::RequestAdmission,
            DrainGrant::DrainRequired | DrainGrant::Draining | DrainGrant::DrainMcpPaused => {
                Transition::ContinueDrain
            }
            DrainGrant::DrainComplete => Transition::HoldComplete,
        }
    } else {
        match grant {
            DrainGrant::Idle => Transition::EnsureSchedulable,
            _ => Transition::ReturnToIdle,
        }
    }
}
