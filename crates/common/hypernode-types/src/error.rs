use thiserror::Error;

use crate::node::LifecycleState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Offers that cannot even be evaluated for admission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OfferError {
    #[error("Offer is missing a job id")]
    MissingJobId,

    #[error("Offer {0} has an empty payload reference")]
    EmptyPayload(String),

    #[error("Offer {job_id} declares an invalid resource amount: {detail}")]
    InvalidResources { job_id: String, detail: String },
}
