//! Triage for errored flows.
//!
//! When a flow captures errors it stops making progress and is admitted
//! here. Registered staff are consulted in registration order; the first one
//! that claims the errors decides the disposition. Nobody claiming them
//! means the errors are final and the flow is terminated with propagation to
//! its peers.

use ledgerflow_types::{FlowError, FlowErrorClass, FlowId};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Disposition for an admitted flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    /// The errors are final: propagate to peers and remove the flow.
    Terminal,
    /// Park the flow and retry after `backoff`.
    OvernightObservation {
        /// Delay before the retry wakeup.
        backoff: Duration,
    },
    /// Retry immediately, without a backoff.
    ResuscitateImmediately,
    /// This staff member has no opinion; ask the next one.
    NotMyError,
}

/// One triage rule. Implementations inspect the captured errors and either
/// claim them with a disposition or pass with [`Diagnosis::NotMyError`].
pub trait Staff: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Examine an admitted flow. `admission_count` is how many times this
    /// flow has been admitted for the same error class, starting at 1.
    fn examine(&self, flow_id: FlowId, errors: &[FlowError], admission_count: u32) -> Diagnosis;
}

/// Backoff tuning for retry dispositions.
#[derive(Debug, Clone)]
pub struct HospitalConfig {
    /// Backoff for the first retry.
    pub base_backoff: Duration,
    /// Ceiling the doubling backoff saturates at.
    pub max_backoff: Duration,
}

impl Default for HospitalConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
        }
    }
}

/// The flow hospital: a staff chain plus per-flow admission history.
pub struct FlowHospital {
    config: HospitalConfig,
    staff: Vec<Box<dyn Staff>>,
    admissions: HashMap<(FlowId, FlowErrorClass), u32>,
}

impl FlowHospital {
    /// Hospital with no staff. Every admission is terminal until staff are
    /// registered.
    pub fn new(config: HospitalConfig) -> Self {
        Self { config, staff: Vec::new(), admissions: HashMap::new() }
    }

    /// Hospital with the standard staff chain.
    pub fn with_default_staff(config: HospitalConfig) -> Self {
        let mut hospital = Self::new(config);
        hospital.register(Box::new(DuplicateInsertStaff));
        hospital.register(Box::new(TransientConnectionStaff));
        hospital
    }

    /// Append a staff member to the consultation chain.
    pub fn register(&mut self, staff: Box<dyn Staff>) {
        self.staff.push(staff);
    }

    /// Admit an errored flow and return the disposition.
    ///
    /// Consults staff in registration order; the first non-[`Diagnosis::NotMyError`]
    /// answer wins. An unclaimed admission is terminal.
    pub fn admit(&mut self, flow_id: FlowId, errors: &[FlowError]) -> Diagnosis {
        let class = match errors.first() {
            Some(error) => error.class,
            None => return Diagnosis::Terminal,
        };
        let count = self.admissions.entry((flow_id, class)).or_insert(0);
        *count += 1;
        let admission_count = *count;

        for staff in &self.staff {
            let diagnosis = staff.examine(flow_id, errors, admission_count);
            if diagnosis != Diagnosis::NotMyError {
                info!(
                    flow_id = %flow_id,
                    staff = staff.name(),
                    admission = admission_count,
                    ?diagnosis,
                    "flow admitted"
                );
                return self.apply_backoff(diagnosis, admission_count);
            }
            debug!(flow_id = %flow_id, staff = staff.name(), "staff passed");
        }
        info!(flow_id = %flow_id, admission = admission_count, "no staff claimed errors, terminal");
        Diagnosis::Terminal
    }

    /// A flow left the hospital for good; forget its history.
    pub fn discharge(&mut self, flow_id: FlowId) {
        self.admissions.retain(|(id, _), _| *id != flow_id);
    }

    fn apply_backoff(&self, diagnosis: Diagnosis, admission_count: u32) -> Diagnosis {
        match diagnosis {
            Diagnosis::OvernightObservation { .. } => {
                let doublings = admission_count.saturating_sub(1).min(16);
                let backoff = self
                    .config
                    .base_backoff
                    .saturating_mul(1u32 << doublings)
                    .min(self.config.max_backoff);
                Diagnosis::OvernightObservation { backoff }
            }
            other => other,
        }
    }
}

/// Retries transient infrastructure failures with a doubling backoff.
pub struct TransientConnectionStaff;

impl Staff for TransientConnectionStaff {
    fn name(&self) -> &'static str {
        "transient-connection"
    }

    fn examine(&self, _flow_id: FlowId, errors: &[FlowError], _admission_count: u32) -> Diagnosis {
        if errors.iter().all(|e| e.class == FlowErrorClass::TransientInfrastructure) {
            Diagnosis::OvernightObservation { backoff: Duration::ZERO }
        } else {
            Diagnosis::NotMyError
        }
    }
}

/// Resumes flows that hit a duplicate-key insert while replaying a
/// checkpointed effect. The row already exists, so the effect took hold
/// before the crash and the flow can continue at once.
pub struct DuplicateInsertStaff;

impl Staff for DuplicateInsertStaff {
    fn name(&self) -> &'static str {
        "duplicate-insert"
    }

    fn examine(&self, _flow_id: FlowId, errors: &[FlowError], _admission_count: u32) -> Diagnosis {
        if errors.iter().all(|e| e.class == FlowErrorClass::StorageDuplicate) {
            Diagnosis::ResuscitateImmediately
        } else {
            Diagnosis::NotMyError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(seed: u8) -> FlowId {
        FlowId::from_bytes([seed; 16])
    }

    #[test]
    fn test_empty_hospital_is_terminal() {
        let mut hospital = FlowHospital::new(HospitalConfig::default());
        let diagnosis = hospital.admit(flow(1), &[FlowError::business(1, "boom")]);
        assert_eq!(diagnosis, Diagnosis::Terminal);
    }

    #[test]
    fn test_business_errors_are_terminal_under_default_staff() {
        let mut hospital = FlowHospital::with_default_staff(HospitalConfig::default());
        let diagnosis = hospital.admit(flow(1), &[FlowError::business(1, "boom")]);
        assert_eq!(diagnosis, Diagnosis::Terminal);
    }

    #[test]
    fn test_transient_errors_get_doubling_capped_backoff() {
        let config = HospitalConfig {
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(35),
        };
        let mut hospital = FlowHospital::with_default_staff(config);
        let errors = [FlowError::transient(1, "connection reset")];

        let expected = [10, 20, 35, 35];
        for seconds in expected {
            let diagnosis = hospital.admit(flow(1), &errors);
            assert_eq!(
                diagnosis,
                Diagnosis::OvernightObservation { backoff: Duration::from_secs(seconds) }
            );
        }
    }

    #[test]
    fn test_admission_counts_are_per_flow_and_class() {
        let mut hospital = FlowHospital::with_default_staff(HospitalConfig::default());
        let errors = [FlowError::transient(1, "timeout")];
        hospital.admit(flow(1), &errors);
        hospital.admit(flow(1), &errors);

        // A different flow starts from the base backoff.
        let diagnosis = hospital.admit(flow(2), &errors);
        assert_eq!(
            diagnosis,
            Diagnosis::OvernightObservation { backoff: Duration::from_secs(10) }
        );
    }

    #[test]
    fn test_duplicate_insert_resuscitates_immediately() {
        let mut hospital = FlowHospital::with_default_staff(HospitalConfig::default());
        let diagnosis = hospital.admit(flow(1), &[FlowError::duplicate(1, "unique violation")]);
        assert_eq!(diagnosis, Diagnosis::ResuscitateImmediately);
    }

    #[test]
    fn test_mixed_errors_fall_through_to_terminal() {
        let mut hospital = FlowHospital::with_default_staff(HospitalConfig::default());
        let diagnosis = hospital.admit(
            flow(1),
            &[
                FlowError::transient(1, "timeout"),
                FlowError::business(2, "validation failed"),
            ],
        );
        assert_eq!(diagnosis, Diagnosis::Terminal);
    }

    #[test]
    fn test_discharge_resets_history() {
        let mut hospital = FlowHospital::with_default_staff(HospitalConfig::default());
        let errors = [FlowError::transient(1, "timeout")];
        hospital.admit(flow(1), &errors);
        hospital.discharge(flow(1));
        let diagnosis = hospital.admit(flow(1), &errors);
        assert_eq!(
            diagnosis,
            Diagnosis::OvernightObservation { backoff: Duration::from_secs(10) }
        );
    }

    #[test]
    fn test_first_claiming_staff_wins() {
        struct AlwaysTerminal;
        impl Staff for AlwaysTerminal {
            fn name(&self) -> &'static str {
                "always-terminal"
            }
            fn examine(&self, _: FlowId, _: &[FlowError], _: u32) -> Diagnosis {
                Diagnosis::Terminal
            }
        }

        let mut hospital = FlowHospital::new(HospitalConfig::default());
        hospital.register(Box::new(AlwaysTerminal));
        hospital.register(Box::new(TransientConnectionStaff));

        let diagnosis = hospital.admit(flow(1), &[FlowError::transient(1, "timeout")]);
        assert_eq!(diagnosis, Diagnosis::Terminal);
    }
}
