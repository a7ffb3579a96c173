use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub id: i64,
    pub name: String,
    pub unit: Option<String>,
    pub created_at: OffsetDateTime,
}
