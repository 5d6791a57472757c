// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Controller errors.

/// An error returned by the controller's front end.
///
/// Only immediately-rejectable conditions surface here. Transient
/// collaborator failures are retried inside the reconcile loop with
/// backoff, and blocking conditions (a replica that never becomes ready, a
/// claim that never binds) are reported through the set's status instead.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The spec's set or service name is not usable as a DNS label.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// The spec's volume claim template is malformed.
    #[error("invalid volume claim template {name:?}: {reason}")]
    InvalidClaimTemplate {
        /// The claim template's name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// An applied spec attempted to change a field that anchors replica
    /// identity.
    #[error("field {field} of replica set {set:?} cannot change once the set exists")]
    ImmutableField {
        /// The set whose spec was rejected.
        set: String,
        /// The field that may not change.
        field: &'static str,
    },
    /// The named set is not managed by this controller.
    #[error("unknown replica set {0:?}")]
    UnknownSet(String),
    /// The set's reconcile task is gone; the controller is shutting down
    /// or the set finished deletion.
    #[error("replica set {0:?} is no longer reconciled")]
    SetClosed(String),
}
