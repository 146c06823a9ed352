//! Column identifiers and prefixed table names.

use sea_orm::DeriveIden;
use sea_orm::sea_query::Alias;

/// Columns of the entity state table.
#[derive(DeriveIden, Clone, Copy)]
pub enum Objects {
    Type,
    Id,
    State,
    Version,
    CreatedAt,
    UpdatedAt,
    // Legacy locking columns, created in v1 and dropped in v2.
    LockedBy,
    LockedAt,
}

/// Columns of the alarm table.
#[derive(DeriveIden, Clone, Copy)]
pub enum Alarms {
    Type,
    Id,
    Name,
    ScheduledAt,
    ClaimedAt,
    CreatedAt,
    UpdatedAt,
}

pub fn objects_table(prefix: Option<&str>) -> Alias {
    prefixed(prefix, "objects")
}

pub fn alarms_table(prefix: Option<&str>) -> Alias {
    prefixed(prefix, "alarms")
}

pub fn prefixed(prefix: Option<&str>, base: &str) -> Alias {
    match prefix {
        Some(p) if !p.is_empty() => Alias::new(format!("{p}{base}")),
        _ => Alias::new(base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::sea_query::Iden;

    #[test]
    fn table_names_carry_prefix() {
        assert_eq!(objects_table(None).to_string(), "objects");
        assert_eq!(objects_table(Some("")).to_string(), "objects");
        assert_eq!(alarms_table(Some("tenant_a_")).to_string(), "tenant_a_alarms");
    }
}
