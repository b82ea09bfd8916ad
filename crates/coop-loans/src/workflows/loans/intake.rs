//! Typed intake forms built from the flat field maps delivered by the form surfaces.
//!
//! Each role has its own form struct and an explicit `from_fields` mapping. Fields a form
//! does not know about are carried along as opaque detail.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::domain::{
    ContactCard, CooperatorId, GroupId, GuarantorStatement, LoanDetails, OfficerCard,
    OfficerReview, ReviewDecision,
};

/// Raw submission as delivered by an intake surface: human-readable field name to value.
pub type FieldMap = BTreeMap<String, String>;

/// Validation errors raised while mapping a field map onto a typed form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntakeError {
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),
    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("cooperator {0} appears more than once in the enrollment")]
    DuplicateParticipant(CooperatorId),
}

/// Light syntactic check used before anything is handed to the delivery channel.
pub fn is_valid_email(raw: &str) -> bool {
    let candidate = raw.trim();
    if candidate.is_empty() || candidate.chars().any(char::is_whitespace) {
        return false;
    }

    let mut parts = candidate.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

fn is_valid_phone(raw: &str) -> bool {
    let digits = raw.chars().filter(char::is_ascii_digit).count();
    digits >= 7
        && raw
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')' | '.'))
}

fn optional(fields: &FieldMap, name: &str) -> Option<String> {
    fields
        .get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn required(fields: &FieldMap, name: &'static str) -> Result<String, IntakeError> {
    optional(fields, name).ok_or(IntakeError::MissingField(name))
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, IntakeError> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, ',' | ' ')).collect();
    cleaned.parse::<T>().map_err(|_| IntakeError::InvalidField {
        field,
        reason: format!("'{raw}' is not a whole number"),
    })
}

fn extra_fields(fields: &FieldMap, known: &[&str]) -> BTreeMap<String, String> {
    fields
        .iter()
        .filter(|(name, value)| !known.contains(&name.as_str()) && !value.trim().is_empty())
        .map(|(name, value)| (name.clone(), value.trim().to_string()))
        .collect()
}

struct ContactFields {
    cooperator_id: &'static str,
    name: &'static str,
    phone: &'static str,
    email: &'static str,
}

impl ContactFields {
    fn names(&self) -> [&'static str; 4] {
        [self.cooperator_id, self.name, self.phone, self.email]
    }

    fn read(&self, fields: &FieldMap) -> Result<ContactCard, IntakeError> {
        let cooperator_id = required(fields, self.cooperator_id)?;
        let name = required(fields, self.name)?;
        let phone = required(fields, self.phone)?;
        let email = required(fields, self.email)?;

        if !is_valid_phone(&phone) {
            return Err(IntakeError::InvalidField {
                field: self.phone,
                reason: format!("'{phone}' is not a phone number"),
            });
        }
        if !is_valid_email(&email) {
            return Err(IntakeError::InvalidField {
                field: self.email,
                reason: format!("'{email}' is not an email address"),
            });
        }

        Ok(ContactCard {
            cooperator_id: CooperatorId(cooperator_id),
            name,
            phone,
            email,
        })
    }
}

const APPLICANT_ENROLLMENT: ContactFields = ContactFields {
    cooperator_id: "Applicant Cooperator ID",
    name: "Applicant Name",
    phone: "Applicant Phone",
    email: "Applicant Email",
};

const GUARANTOR1_ENROLLMENT: ContactFields = ContactFields {
    cooperator_id: "Guarantor 1 Cooperator ID",
    name: "Guarantor 1 Name",
    phone: "Guarantor 1 Phone",
    email: "Guarantor 1 Email",
};

const GUARANTOR2_ENROLLMENT: ContactFields = ContactFields {
    cooperator_id: "Guarantor 2 Cooperator ID",
    name: "Guarantor 2 Name",
    phone: "Guarantor 2 Phone",
    email: "Guarantor 2 Email",
};

const PARTY_CONTACT: ContactFields = ContactFields {
    cooperator_id: "Cooperator ID",
    name: "Name",
    phone: "Phone",
    email: "Email",
};

const GROUP_ID: &str = "Group ID";
const COMMENTS: &str = "Comments";

/// Joint enrollment of an applicant and two guarantors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentForm {
    pub applicant: ContactCard,
    pub guarantor1: ContactCard,
    pub guarantor2: ContactCard,
}

impl EnrollmentForm {
    pub fn from_fields(fields: &FieldMap) -> Result<Self, IntakeError> {
        let form = Self {
            applicant: APPLICANT_ENROLLMENT.read(fields)?,
            guarantor1: GUARANTOR1_ENROLLMENT.read(fields)?,
            guarantor2: GUARANTOR2_ENROLLMENT.read(fields)?,
        };
        form.validate()?;
        Ok(form)
    }

    pub fn validate(&self) -> Result<(), IntakeError> {
        let ids = [
            &self.applicant.cooperator_id,
            &self.guarantor1.cooperator_id,
            &self.guarantor2.cooperator_id,
        ];
        for (index, id) in ids.iter().enumerate() {
            if ids[index + 1..].contains(id) {
                return Err(IntakeError::DuplicateParticipant((*id).clone()));
            }
        }
        Ok(())
    }
}

/// Applicant loan application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicantForm {
    pub group_id: Option<GroupId>,
    pub applicant: ContactCard,
    pub loan: LoanDetails,
}

impl ApplicantForm {
    const LOAN_AMOUNT: &'static str = "Loan Amount";
    const LOAN_PURPOSE: &'static str = "Loan Purpose";
    const REPAYMENT_MONTHS: &'static str = "Repayment Months";
    const MONTHLY_INCOME: &'static str = "Monthly Income";

    pub fn from_fields(fields: &FieldMap) -> Result<Self, IntakeError> {
        let group_id = optional(fields, GROUP_ID).map(GroupId);
        let applicant = PARTY_CONTACT.read(fields)?;

        let loan_amount: u64 =
            parse_number(Self::LOAN_AMOUNT, &required(fields, Self::LOAN_AMOUNT)?)?;
        if loan_amount == 0 {
            return Err(IntakeError::InvalidField {
                field: Self::LOAN_AMOUNT,
                reason: "must be greater than zero".to_string(),
            });
        }
        let loan_purpose = required(fields, Self::LOAN_PURPOSE)?;
        let repayment_months: u16 = parse_number(
            Self::REPAYMENT_MONTHS,
            &required(fields, Self::REPAYMENT_MONTHS)?,
        )?;
        let monthly_income = optional(fields, Self::MONTHLY_INCOME)
            .map(|raw| parse_number::<u64>(Self::MONTHLY_INCOME, &raw))
            .transpose()?;

        let mut known = vec![
            GROUP_ID,
            COMMENTS,
            Self::LOAN_AMOUNT,
            Self::LOAN_PURPOSE,
            Self::REPAYMENT_MONTHS,
            Self::MONTHLY_INCOME,
        ];
        known.extend(PARTY_CONTACT.names());

        Ok(Self {
            group_id,
            applicant,
            loan: LoanDetails {
                loan_amount,
                loan_purpose,
                repayment_months,
                monthly_income,
                comments: optional(fields, COMMENTS),
                extra: extra_fields(fields, &known),
            },
        })
    }
}

/// Guarantor acknowledgement form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuarantorForm {
    pub group_id: GroupId,
    pub contact: ContactCard,
    pub comments: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl GuarantorForm {
    pub fn from_fields(fields: &FieldMap) -> Result<Self, IntakeError> {
        let group_id = GroupId(required(fields, GROUP_ID)?);
        let contact = PARTY_CONTACT.read(fields)?;

        let mut known = vec![GROUP_ID, COMMENTS];
        known.extend(PARTY_CONTACT.names());

        Ok(Self {
            group_id,
            contact,
            comments: optional(fields, COMMENTS),
            extra: extra_fields(fields, &known),
        })
    }

    pub(crate) fn statement(&self, now: DateTime<Utc>) -> GuarantorStatement {
        GuarantorStatement {
            comments: self.comments.clone(),
            extra: self.extra.clone(),
            submitted_at: now,
        }
    }
}

/// Officer's finance review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfficerReviewForm {
    pub group_id: GroupId,
    pub decision: ReviewDecision,
    pub comments: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl OfficerReviewForm {
    const DECISION: &'static str = "Decision";

    pub fn from_fields(fields: &FieldMap) -> Result<Self, IntakeError> {
        let group_id = GroupId(required(fields, GROUP_ID)?);
        let raw_decision = required(fields, Self::DECISION)?;
        let decision =
            ReviewDecision::parse(&raw_decision).ok_or_else(|| IntakeError::InvalidField {
                field: Self::DECISION,
                reason: format!("'{raw_decision}' is neither Approved nor Rejected"),
            })?;

        Ok(Self {
            group_id,
            decision,
            comments: optional(fields, COMMENTS),
            extra: extra_fields(fields, &[GROUP_ID, COMMENTS, Self::DECISION]),
        })
    }

    pub(crate) fn review(&self, now: DateTime<Utc>) -> OfficerReview {
        OfficerReview {
            decision: self.decision,
            comments: self.comments.clone(),
            extra: self.extra.clone(),
            reviewed_at: now,
        }
    }
}

/// Officer fields as written by an administrator. Completeness is checked by the
/// assignment transition, not here, so a partial entry surfaces as an invalid officer.
pub fn officer_from_fields(fields: &FieldMap) -> OfficerCard {
    let read = |name: &str| optional(fields, name).unwrap_or_default();
    OfficerCard {
        officer_id: read("Officer ID"),
        name: read("Officer Name"),
        phone: read("Officer Phone"),
        email: read("Officer Email"),
    }
}
