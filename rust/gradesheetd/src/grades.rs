use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use thiserror::Error;

pub const GRADE_FIELD_COUNT: usize = 8;
pub const DEFAULT_MAX_TOTAL: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradeField {
    Attendance,
    Participation,
    Assignments,
    Speaking,
    Writing,
    CommunicativeCompetence,
    FinalOral,
    Exam,
}

impl GradeField {
    /// Summation and display order.
    pub const ALL: [GradeField; GRADE_FIELD_COUNT] = [
        GradeField::Attendance,
        GradeField::Participation,
        GradeField::Assignments,
        GradeField::Speaking,
        GradeField::Writing,
        GradeField::CommunicativeCompetence,
        GradeField::FinalOral,
        GradeField::Exam,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Attendance => 0,
            Self::Participation => 1,
            Self::Assignments => 2,
            Self::Speaking => 3,
            Self::Writing => 4,
            Self::CommunicativeCompetence => 5,
            Self::FinalOral => 6,
            Self::Exam => 7,
        }
    }

    /// Column name in storage.
    pub fn key(self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
            Self::Participation => "participation",
            Self::Assignments => "assignments",
            Self::Speaking => "speaking",
            Self::Writing => "writing",
            Self::CommunicativeCompetence => "communicative_competence",
            Self::FinalOral => "final_oral",
            Self::Exam => "exam",
        }
    }

    /// Field name on the wire.
    pub fn camel_key(self) -> &'static str {
        match self {
            Self::CommunicativeCompetence => "communicativeCompetence",
            Self::FinalOral => "finalOral",
            other => other.key(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Attendance => "Attendance",
            Self::Participation => "Participation",
            Self::Assignments => "Assignments",
            Self::Speaking => "Speaking",
            Self::Writing => "Writing",
            Self::CommunicativeCompetence => "Communicative Competence",
            Self::FinalOral => "Final Oral",
            Self::Exam => "Exam",
        }
    }

    pub fn default_max(self) -> f64 {
        match self {
            Self::Writing => 15.0,
            Self::Exam => 25.0,
            _ => 10.0,
        }
    }

    /// Accepts both the storage and the wire spelling.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.key() == s || f.camel_key() == s)
    }
}

/// Above this magnitude an f64 carries no fractional cents.
const ROUNDING_CEILING: f64 = 1e15;

/// 2-decimal rounding, half away from zero on the value scaled by 100.
///
/// `0.125` rounds to `0.13`, but `2.345` is stored as `2.34499..` and rounds to `2.34`.
/// Magnitudes of `1e15` and up are returned as is, so scaling never overflows.
pub fn round_2(x: f64) -> f64 {
    if !x.is_finite() || x.abs() >= ROUNDING_CEILING {
        return x;
    }
    (x * 100.0).round() / 100.0
}

/// Lenient numeric read of a user-entered sub-score. Anything that does not
/// yield a finite number is treated as unset.
pub fn coerce_score(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                None
            } else {
                cleaned.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubScores {
    pub attendance: Option<f64>,
    pub participation: Option<f64>,
    pub assignments: Option<f64>,
    pub speaking: Option<f64>,
    pub writing: Option<f64>,
    pub communicative_competence: Option<f64>,
    pub final_oral: Option<f64>,
    pub exam: Option<f64>,
}

impl SubScores {
    pub fn get(&self, field: GradeField) -> Option<f64> {
        match field {
            GradeField::Attendance => self.attendance,
            GradeField::Participation => self.participation,
            GradeField::Assignments => self.assignments,
            GradeField::Speaking => self.speaking,
            GradeField::Writing => self.writing,
            GradeField::CommunicativeCompetence => self.communicative_competence,
            GradeField::FinalOral => self.final_oral,
            GradeField::Exam => self.exam,
        }
    }

    pub fn set(&mut self, field: GradeField, value: Option<f64>) {
        let slot = match field {
            GradeField::Attendance => &mut self.attendance,
            GradeField::Participation => &mut self.participation,
            GradeField::Assignments => &mut self.assignments,
            GradeField::Speaking => &mut self.speaking,
            GradeField::Writing => &mut self.writing,
            GradeField::CommunicativeCompetence => &mut self.communicative_competence,
            GradeField::FinalOral => &mut self.final_oral,
            GradeField::Exam => &mut self.exam,
        };
        *slot = value;
    }

}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub student: String,
    pub student_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub student: String,
    pub student_name: String,
    #[serde(flatten)]
    pub scores: SubScores,
    #[serde(default)]
    pub total: f64,
}

impl GradeRecord {
    pub fn new(student: impl Into<String>, student_name: impl Into<String>) -> Self {
        Self {
            student: student.into(),
            student_name: student_name.into(),
            scores: SubScores::default(),
            total: 0.0,
        }
    }

    /// Sum of the sub-scores in field order. Unset and non-finite values are
    /// skipped, as is any addend that would overflow the running sum.
    pub fn computed_total(&self) -> f64 {
        let mut total: f64 = 0.0;
        for field in GradeField::ALL {
            let Some(v) = self.scores.get(field) else {
                continue;
            };
            let next = total + v;
            if next.is_finite() {
                total = next;
            }
        }
        round_2(total)
    }

    pub fn recompute_total(&mut self) -> f64 {
        self.total = self.computed_total();
        self.total
    }

    /// `row #n` is 1-based.
    pub fn label(&self, idx: usize) -> String {
        if !self.student_name.trim().is_empty() {
            self.student_name.clone()
        } else if !self.student.trim().is_empty() {
            self.student.clone()
        } else {
            format!("row #{}", idx + 1)
        }
    }
}

/// Source of the initial student list for a batch.
pub trait RosterSource {
    fn enrolled_students(&self, batch_id: &str) -> anyhow::Result<Vec<StudentRef>>;
}

/// Ordered grade records, unique by `student`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    records: Vec<GradeRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later records repeating an earlier `student` are dropped.
    pub fn from_records(records: impl IntoIterator<Item = GradeRecord>) -> Self {
        let mut roster = Self::new();
        for r in records {
            roster.push(r);
        }
        roster
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[GradeRecord] {
        &self.records
    }

    pub fn get(&self, student: &str) -> Option<&GradeRecord> {
        self.records.iter().find(|r| r.student == student)
    }

    /// The record for `student` with its display index.
    pub fn get_mut(&mut self, student: &str) -> Option<(usize, &mut GradeRecord)> {
        self.records
            .iter_mut()
            .enumerate()
            .find(|(_, r)| r.student == student)
    }

    /// Returns false (and leaves the roster untouched) on a duplicate student.
    pub fn push(&mut self, record: GradeRecord) -> bool {
        if self.get(&record.student).is_some() {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn recompute_all(&mut self) {
        for r in &mut self.records {
            r.recompute_total();
        }
    }

    pub fn check_over_limit(&self, limit: f64) -> bool {
        self.records.iter().any(|r| r.total > limit)
    }

    /// Appends one blank record per external student, only while the roster is
    /// empty. Returns how many records were added.
    pub fn populate_if_empty<I>(&mut self, students: I) -> usize
    where
        I: IntoIterator<Item = StudentRef>,
    {
        if !self.is_empty() {
            return 0;
        }
        let mut seen: HashSet<String> = HashSet::new();
        for s in students {
            if !seen.insert(s.student.clone()) {
                continue;
            }
            self.records.push(GradeRecord::new(s.student, s.student_name));
        }
        self.records.len()
    }

    /// Consults `source` only when there is something to populate.
    pub fn populate_from_source(
        &mut self,
        source: &dyn RosterSource,
        batch_id: &str,
    ) -> anyhow::Result<usize> {
        if !self.is_empty() {
            return Ok(0);
        }
        let students = source.enrolled_students(batch_id)?;
        Ok(self.populate_if_empty(students))
    }
}

pub fn over_limit_warning(limit: f64) -> String {
    format!(
        "Some student totals exceed {}. Please adjust before submitting.",
        limit
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingConfig {
    pub max_total: f64,
    pub component_max: [f64; GRADE_FIELD_COUNT],
}

impl Default for GradingConfig {
    fn default() -> Self {
        let mut component_max = [0.0; GRADE_FIELD_COUNT];
        for f in GradeField::ALL {
            component_max[f.index()] = f.default_max();
        }
        Self {
            max_total: DEFAULT_MAX_TOTAL,
            component_max,
        }
    }
}

impl GradingConfig {
    pub fn max_for(&self, field: GradeField) -> f64 {
        self.component_max[field.index()]
    }

    pub fn components_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            GradeField::ALL
                .iter()
                .map(|f| {
                    json!({
                        "field": f.camel_key(),
                        "label": f.label(),
                        "max": self.max_for(*f),
                    })
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeError {
    #[error("Add at least one grade record before submitting.")]
    EmptySheet,

    #[error("Please enter {} for {student} before submitting.", .field.label())]
    MissingScore { field: GradeField, student: String },

    #[error("{} for {student} must be between 0 and {max}.", .field.label())]
    ScoreOutOfRange {
        field: GradeField,
        student: String,
        value: f64,
        max: f64,
    },

    #[error("Total for {student} cannot exceed {max}.")]
    TotalOverLimit { student: String, total: f64, max: f64 },
}

impl GradeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptySheet => "empty_sheet",
            Self::MissingScore { .. } => "missing_score",
            Self::ScoreOutOfRange { .. } => "score_out_of_range",
            Self::TotalOverLimit { .. } => "total_over_limit",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut out = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        match self {
            Self::EmptySheet => {}
            Self::MissingScore { field, student } => {
                out["field"] = json!(field.camel_key());
                out["student"] = json!(student);
            }
            Self::ScoreOutOfRange {
                field,
                student,
                value,
                max,
            } => {
                out["field"] = json!(field.camel_key());
                out["student"] = json!(student);
                out["value"] = json!(value);
                out["max"] = json!(max);
            }
            Self::TotalOverLimit {
                student,
                total,
                max,
            } => {
                out["student"] = json!(student);
                out["total"] = json!(total);
                out["max"] = json!(max);
            }
        }
        out
    }
}

/// A set sub-score must be within `0..=max` for its component; unset passes.
pub fn validate_field(
    record: &GradeRecord,
    idx: usize,
    field: GradeField,
    config: &GradingConfig,
) -> Result<(), GradeError> {
    let Some(value) = record.scores.get(field) else {
        return Ok(());
    };
    let max = config.max_for(field);
    if value < 0.0 || value > max {
        return Err(GradeError::ScoreOutOfRange {
            field,
            student: record.label(idx),
            value,
            max,
        });
    }
    Ok(())
}

/// Every set sub-score must be within `0..=max` for its component.
pub fn validate_limits(
    record: &GradeRecord,
    idx: usize,
    config: &GradingConfig,
) -> Result<(), GradeError> {
    for field in GradeField::ALL {
        validate_field(record, idx, field, config)?;
    }
    Ok(())
}

fn record_issues(record: &GradeRecord, idx: usize, config: &GradingConfig) -> Vec<GradeError> {
    let mut issues = Vec::new();
    for field in GradeField::ALL {
        if record.scores.get(field).is_none() {
            issues.push(GradeError::MissingScore {
                field,
                student: record.label(idx),
            });
        }
    }
    if let Err(e) = validate_limits(record, idx, config) {
        issues.push(e);
    }
    let total = record.computed_total();
    if total > config.max_total {
        issues.push(GradeError::TotalOverLimit {
            student: record.label(idx),
            total,
            max: config.max_total,
        });
    }
    issues
}

/// All submit blockers, in roster order.
pub fn collect_issues(roster: &Roster, config: &GradingConfig) -> Vec<GradeError> {
    if roster.is_empty() {
        return vec![GradeError::EmptySheet];
    }
    roster
        .records()
        .iter()
        .enumerate()
        .flat_map(|(idx, r)| record_issues(r, idx, config))
        .collect()
}

/// Recomputes every total, then reports the first submit blocker.
pub fn validate_for_submit(roster: &mut Roster, config: &GradingConfig) -> Result<(), GradeError> {
    roster.recompute_all();
    match collect_issues(roster, config).into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
