use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::db::DatabaseError;

/// Macro to generate enum with as_str + std::str::FromStr pattern.
/// The string form is used both in storage and on the wire.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

str_enum!(
    /// Prescription status as reported by the gateway and stored in the
    /// status-event tables.
    ErxStatus {
        Entered => "Entered",
        Sending => "Sending",
        Sent => "Sent",
        Error => "Error",
        ErrorResolved => "ErrorResolved",
        Deleted => "Deleted",
        NewRxFromDntf => "NewRxFromDNTF",
        Approved => "Approved",
        Denied => "Denied",
        Requested => "Requested",
    }
);

str_enum!(
    /// Internal status of a status-event row. Exactly one row per owner is
    /// `Active`.
    EventState {
        Active => "ACTIVE",
        Inactive => "INACTIVE",
    }
);

str_enum!(
    /// What a status history belongs to.
    OwnerKind {
        Treatment => "TREATMENT",
        RefillRequest => "REFILL_REQUEST",
        UnlinkedDntfTreatment => "UNLINKED_DNTF_TREATMENT",
    }
);

str_enum!(PatientStatus {
    Registered => "REGISTERED",
    Unlinked => "UNLINKED",
});

str_enum!(TreatmentPlanStatus {
    Draft => "DRAFT",
    Submitted => "SUBMITTED",
    Active => "ACTIVE",
});

str_enum!(QueueEventType {
    PatientVisit => "PATIENT_VISIT",
    TreatmentPlan => "TREATMENT_PLAN",
    RefillRequest => "REFILL_REQUEST",
    TransmissionError => "TRANSMISSION_ERROR",
    RefillTransmissionError => "REFILL_TRANSMISSION_ERROR",
    UnlinkedDntfTransmissionError => "UNLINKED_DNTF_TRANSMISSION_ERROR",
    CaseMessage => "CASE_MESSAGE",
});

str_enum!(QueueItemStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Replied => "REPLIED",
    RefillApproved => "REFILL_APPROVED",
    RefillDenied => "REFILL_DENIED",
    ErrorResolved => "ERROR_RESOLVED",
});

str_enum!(QueueItemKind {
    Visit => "VISIT",
    TreatmentPlan => "TREATMENT_PLAN",
    Treatment => "TREATMENT",
    RefillRequest => "REFILL_REQUEST",
    UnlinkedDntfTreatment => "UNLINKED_DNTF_TREATMENT",
    Case => "CASE",
});

str_enum!(
    /// How the router treats controlled substances in a plan.
    ControlledSubstancePolicy {
        RejectPlan => "reject_plan",
        SkipControlled => "skip_controlled",
    }
);

impl OwnerKind {
    /// Doctor-queue type emitted when a prescription owned by this kind
    /// lands in Error.
    pub fn transmission_error_type(&self) -> QueueEventType {
        match self {
            Self::Treatment => QueueEventType::TransmissionError,
            Self::RefillRequest => QueueEventType::RefillTransmissionError,
            Self::UnlinkedDntfTreatment => QueueEventType::UnlinkedDntfTransmissionError,
        }
    }

    pub fn queue_item_kind(&self) -> QueueItemKind {
        match self {
            Self::Treatment => QueueItemKind::Treatment,
            Self::RefillRequest => QueueItemKind::RefillRequest,
            Self::UnlinkedDntfTreatment => QueueItemKind::UnlinkedDntfTreatment,
        }
    }
}

impl QueueEventType {
    pub fn is_transmission_error(&self) -> bool {
        matches!(
            self,
            Self::TransmissionError
                | Self::RefillTransmissionError
                | Self::UnlinkedDntfTransmissionError
        )
    }
}

impl Default for ControlledSubstancePolicy {
    fn default() -> Self {
        Self::RejectPlan
    }
}
