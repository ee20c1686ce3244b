use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod canonical;
pub mod envelope;
pub mod nts;
pub mod wire;

pub const DATE_FORMAT: &str = "%Y%m%d";

/// Row fields that carry the filing period, in lookup order.
pub const PERIOD_FIELDS: [&str; 4] = ["txnrmYm", "pymnYm", "rtnYm", "sbmsYm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportCategory {
    Withholding,
    Vat,
    Corporate,
    GlobalIncome,
    CapitalGains,
    Inheritance,
    Gift,
    RealEstate,
}

impl ReportCategory {
    pub const ALL: [ReportCategory; 8] = [
        ReportCategory::Withholding,
        ReportCategory::Vat,
        ReportCategory::Corporate,
        ReportCategory::GlobalIncome,
        ReportCategory::CapitalGains,
        ReportCategory::Inheritance,
        ReportCategory::Gift,
        ReportCategory::RealEstate,
    ];

    /// Internal `itrfCd` understood by the reporting endpoint.
    pub fn code(self) -> &'static str {
        match self {
            ReportCategory::Withholding => "14",
            ReportCategory::Vat => "41",
            ReportCategory::Corporate => "31",
            ReportCategory::GlobalIncome => "10",
            ReportCategory::CapitalGains => "22",
            ReportCategory::Inheritance => "26",
            ReportCategory::Gift => "27",
            ReportCategory::RealEstate => "17",
        }
    }

    /// Menu index (`tm3lIdx`); only used to build the Referer header.
    pub fn menu_id(self) -> &'static str {
        match self {
            ReportCategory::Withholding => "0405030000",
            ReportCategory::Vat => "0405010000",
            ReportCategory::Corporate => "0405020000",
            ReportCategory::GlobalIncome => "0405040000",
            ReportCategory::CapitalGains => "0405050000",
            ReportCategory::Inheritance => "0405150000",
            ReportCategory::Gift => "0405060000",
            ReportCategory::RealEstate => "0405070000",
        }
    }

    pub fn portal_name(self) -> &'static str {
        match self {
            ReportCategory::Withholding => "원천세",
            ReportCategory::Vat => "부가세",
            ReportCategory::Corporate => "법인세",
            ReportCategory::GlobalIncome => "종합소득세",
            ReportCategory::CapitalGains => "양도소득세",
            ReportCategory::Inheritance => "상속세",
            ReportCategory::Gift => "증여세",
            ReportCategory::RealEstate => "종합부동산세",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            ReportCategory::Withholding => "withholding",
            ReportCategory::Vat => "vat",
            ReportCategory::Corporate => "corporate",
            ReportCategory::GlobalIncome => "global-income",
            ReportCategory::CapitalGains => "capital-gains",
            ReportCategory::Inheritance => "inheritance",
            ReportCategory::Gift => "gift",
            ReportCategory::RealEstate => "real-estate",
        }
    }

    /// Accepts the portal's Korean name or the English slug.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = canonical::normalize_tag(name);
        Self::ALL
            .into_iter()
            .find(|c| c.portal_name() == name || c.slug().eq_ignore_ascii_case(&name))
    }
}

impl std::fmt::Display for ReportCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, &'static str> {
        if start > end {
            return Err("date range start is after end");
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, &'static str> {
        let start = parse_yyyymmdd(start).ok_or("start date must be YYYYMMDD")?;
        let end = parse_yyyymmdd(end).ok_or("end date must be YYYYMMDD")?;
        Self::new(start, end)
    }

    /// First through last day of the month.
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let end = start.checked_add_months(Months::new(1))?.pred_opt()?;
        Some(Self { start, end })
    }

    /// The `count` whole months before `today`'s month, oldest start through
    /// newest end. The current month is never included.
    pub fn trailing_months(today: NaiveDate, count: u32) -> Option<Self> {
        if count == 0 {
            return None;
        }
        let this_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
        let newest = this_month.checked_sub_months(Months::new(1))?;
        let oldest = this_month.checked_sub_months(Months::new(count))?;
        let end = Self::month(newest.year(), newest.month())?.end;
        Some(Self { start: oldest, end })
    }

    pub fn start_yyyymmdd(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    pub fn end_yyyymmdd(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }

    /// `Some((year, month))` when the range lies inside one calendar month.
    pub fn single_month(&self) -> Option<(i32, u32)> {
        (self.start.year() == self.end.year() && self.start.month() == self.end.month())
            .then(|| (self.start.year(), self.start.month()))
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start_yyyymmdd(), self.end_yyyymmdd())
    }
}

pub fn parse_yyyymmdd(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportQuery {
    pub category: ReportCategory,
    pub range: DateRange,
    pub target_id: String,
    pub page: u32,
}

impl ReportQuery {
    pub fn new(category: ReportCategory, target_id: impl Into<String>, range: DateRange) -> Self {
        Self {
            category,
            range,
            target_id: target_id.into(),
            page: 1,
        }
    }

    pub fn for_month(
        category: ReportCategory,
        target_id: impl Into<String>,
        year: i32,
        month: u32,
    ) -> Option<Self> {
        Some(Self::new(category, target_id, DateRange::month(year, month)?))
    }
}

impl std::fmt::Display for ReportQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "category={} target={} range={} page={}",
            self.category, self.target_id, self.range, self.page
        )
    }
}

/// `afdsCl` filter of the client directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementStatus {
    Active,
    Terminated,
    Pending,
}

impl EngagementStatus {
    pub fn code(self) -> &'static str {
        match self {
            EngagementStatus::Active => "1",
            EngagementStatus::Terminated => "2",
            EngagementStatus::Pending => "3",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(EngagementStatus::Active),
            "2" => Some(EngagementStatus::Terminated),
            "3" => Some(EngagementStatus::Pending),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EngagementStatus::Active => "active",
            EngagementStatus::Terminated => "terminated",
            EngagementStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ClientIdentifier {
    Business(String),
    Personal(String),
}

impl ClientIdentifier {
    pub fn as_str(&self) -> &str {
        match self {
            ClientIdentifier::Business(id) | ClientIdentifier::Personal(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub identifier: ClientIdentifier,
    pub display_name: Option<String>,
    pub source_tag: String,
    pub status: String,
    pub raw: Value,
}

impl ClientRecord {
    /// `None` when the row carries neither a business number (`bsno`) nor a
    /// usable personal number (`resno`).
    pub fn from_row(row: &Value, source_tag: &str, status: &str) -> Option<Self> {
        let text = |key: &str| row.get(key).and_then(envelope::non_empty_string);

        let identifier = match text("bsno") {
            Some(bsno) => ClientIdentifier::Business(bsno),
            None => {
                let resno = canonical::strip_mask(&text("resno")?);
                if resno.is_empty() {
                    return None;
                }
                ClientIdentifier::Personal(resno)
            }
        };

        Some(Self {
            identifier,
            display_name: text("txprNm"),
            source_tag: canonical::normalize_tag(source_tag),
            status: status.to_string(),
            raw: row.clone(),
        })
    }

    pub fn target_id(&self) -> &str {
        self.identifier.as_str()
    }
}

/// Keeps the first record seen for each identifier.
pub fn dedup_clients(records: Vec<ClientRecord>) -> Vec<ClientRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.identifier.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserClass {
    Individual,
    Corporate,
    Other(String),
}

impl UserClass {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "01" => UserClass::Individual,
            "02" => UserClass::Corporate,
            other => UserClass::Other(other.to_string()),
        }
    }
}

/// `YYYYMM` period of a row, from the first populated period field.
pub fn row_period(row: &Value) -> Option<String> {
    PERIOD_FIELDS.iter().find_map(|field| {
        let value = envelope::non_empty_string(row.get(*field)?)?;
        (value.len() == 6 && value.bytes().all(|b| b.is_ascii_digit())).then_some(value)
    })
}

/// Rows without a recognizable period are left out.
pub fn group_rows_by_period(rows: &[Value]) -> BTreeMap<String, Vec<Value>> {
    let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in rows {
        if let Some(period) = row_period(row) {
            out.entry(period).or_default().push(row.clone());
        }
    }
    out
}
