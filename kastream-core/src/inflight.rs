//! In-flight bookkeeping: every input record owns a group holding the records
//! produced from it, and the group is the unit the offset-advancing scan
//! reasons about. A group is complete once the broker has acknowledged every
//! record in it; a group that produced nothing is complete from birth.

use std::sync::Arc;

use crate::message::{IncomingMessage, ProducerRecord};

/// One produced record still awaiting its broker acknowledgement.
#[derive(Debug)]
pub(crate) struct InFlightMessage {
    pub(crate) record: ProducerRecord,
    /// Flipped exactly once, false to true, by the produce-ack path.
    pub(crate) ack: bool,
}

/// All records produced from one input record, plus the commit request user
/// code made while processing it. `committed` is fixed at construction.
#[derive(Debug)]
pub(crate) struct InFlightMessageGroup {
    pub(crate) incoming_message: Arc<IncomingMessage>,
    pub(crate) in_flight_messages: Vec<InFlightMessage>,
    pub(crate) committed: bool,
}

impl InFlightMessageGroup {
    pub(crate) fn all_acks_are_true(&self) -> bool {
        self.in_flight_messages.iter().all(|m| m.ack)
    }
}
