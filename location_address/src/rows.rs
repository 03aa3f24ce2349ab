use lalf::error::Result;
use lalf::sparql::{binding_value, SparqlRow};
use rusqlite::{params, Connection};

/// One staged address as extracted from the graph. Unbound variables stay
/// `None`; the row hasher renders them identically to SQL NULLs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AddressStagingRow {
    pub lot: Option<String>,
    pub plan: Option<String>,
    pub unit_type: Option<String>,
    pub unit_number: Option<String>,
    pub unit_suffix: Option<String>,
    pub floor_type: Option<String>,
    pub floor_number: Option<String>,
    pub floor_suffix: Option<String>,
    pub property_name: Option<String>,
    pub street_no_1: Option<String>,
    pub street_no_1_suffix: Option<String>,
    pub street_no_2: Option<String>,
    pub street_no_2_suffix: Option<String>,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub street_type: Option<String>,
    pub street_suffix: Option<String>,
    pub street_full: Option<String>,
    pub locality: Option<String>,
    pub local_authority: Option<String>,
    pub state: Option<String>,
    /// The computed full address string.
    pub address: String,
    pub address_status: Option<String>,
    pub address_standard: Option<String>,
    pub lotplan_status: Option<String>,
    pub address_pid: Option<String>,
}

impl AddressStagingRow {
    pub fn from_binding(row: &SparqlRow) -> Self {
        Self {
            lot: binding_value(row, "lot"),
            plan: binding_value(row, "plan"),
            unit_type: binding_value(row, "unit_type"),
            unit_number: binding_value(row, "unit_number"),
            unit_suffix: binding_value(row, "unit_suffix"),
            floor_type: binding_value(row, "floor_type"),
            floor_number: binding_value(row, "floor_number"),
            floor_suffix: binding_value(row, "floor_suffix"),
            property_name: binding_value(row, "property_name"),
            street_no_1: binding_value(row, "street_no_1"),
            street_no_1_suffix: binding_value(row, "street_no_1_suffix"),
            street_no_2: binding_value(row, "street_no_2"),
            street_no_2_suffix: binding_value(row, "street_no_2_suffix"),
            street_number: binding_value(row, "street_number"),
            street_name: binding_value(row, "street_name"),
            street_type: binding_value(row, "street_type"),
            street_suffix: binding_value(row, "street_suffix"),
            street_full: binding_value(row, "street_full"),
            locality: binding_value(row, "locality"),
            local_authority: binding_value(row, "local_authority"),
            state: binding_value(row, "state"),
            address: address_concatenation(row),
            address_status: binding_value(row, "address_status"),
            address_standard: binding_value(row, "address_standard"),
            lotplan_status: binding_value(row, "lotplan_status"),
            address_pid: binding_value(row, "address_pid"),
        }
    }
}

/// The single-line address presentation, with a unit prefix when a unit
/// number is present and a range dash when a last street number is present.
pub fn address_concatenation(row: &SparqlRow) -> String {
    let value = |variable: &str| {
        row.get(variable)
            .map(|term| term.value.as_str())
            .unwrap_or("")
    };
    let unit_number = value("unit_number");
    let street_no_2 = value("street_no_2");
    format!(
        "{}{}{}{}{}{}{}{}{} {} {} {}",
        value("unit_type"),
        unit_number,
        value("unit_suffix"),
        if unit_number.is_empty() { "" } else { "/" },
        value("street_no_1"),
        value("street_no_1_suffix"),
        if street_no_2.is_empty() { "" } else { "-" },
        street_no_2,
        value("street_no_2_suffix"),
        value("street_full"),
        value("locality"),
        value("state"),
    )
}

/// Bulk-appends one chunk of staged rows. The `id` hash column and the
/// geocode fields stay NULL; geocodes are joined in later.
pub fn insert_staging_rows(conn: &Connection, rows: &[AddressStagingRow]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO address_current_staging VALUES (
            NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
            ?21, ?22, ?23, ?24, ?25, ?26, NULL, NULL, NULL
        )",
    )?;
    for row in rows {
        stmt.execute(params![
            row.lot,
            row.plan,
            row.unit_type,
            row.unit_number,
            row.unit_suffix,
            row.floor_type,
            row.floor_number,
            row.floor_suffix,
            row.property_name,
            row.street_no_1,
            row.street_no_1_suffix,
            row.street_no_2,
            row.street_no_2_suffix,
            row.street_number,
            row.street_name,
            row.street_type,
            row.street_suffix,
            row.street_full,
            row.locality,
            row.local_authority,
            row.state,
            row.address,
            row.address_status,
            row.address_standard,
            row.lotplan_status,
            row.address_pid,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use lalf::sparql::SparqlTerm;

    use super::*;

    fn term(value: &str) -> SparqlTerm {
        SparqlTerm {
            value: value.to_string(),
        }
    }

    fn unit_address_binding() -> SparqlRow {
        let mut row = HashMap::new();
        for (variable, value) in [
            ("lot", "36"),
            ("plan", "SP185408"),
            ("unit_type", "U"),
            ("unit_number", "36"),
            ("floor_type", "Level"),
            ("floor_number", "14"),
            ("street_no_1", "148"),
            ("street_no_1_suffix", "C"),
            ("street_number", "148"),
            ("street_name", "Walker"),
            ("street_type", "Street"),
            ("street_full", "Walker Street"),
            ("locality", "Townsville City"),
            ("local_authority", "Townsville City"),
            ("state", "QLD"),
            ("address_status", "P"),
            ("address_standard", "UK"),
            ("lotplan_status", "C"),
            ("address_pid", "2077263"),
        ] {
            row.insert(variable.to_string(), term(value));
        }
        row
    }

    #[test]
    fn concatenation_formats_a_unit_address() {
        let row = unit_address_binding();
        assert_eq!(
            address_concatenation(&row),
            "U36/148C Walker Street Townsville City QLD"
        );
    }

    #[test]
    fn concatenation_formats_a_street_number_range() {
        let mut row = HashMap::new();
        row.insert("street_no_1".to_string(), term("2"));
        row.insert("street_no_2".to_string(), term("4"));
        row.insert("street_full".to_string(), term("Mary Street"));
        row.insert("locality".to_string(), term("Brisbane City"));
        row.insert("state".to_string(), term("QLD"));
        assert_eq!(address_concatenation(&row), "2-4 Mary Street Brisbane City QLD");
    }

    #[test]
    fn missing_bindings_become_none() {
        let row = unit_address_binding();
        let staged = AddressStagingRow::from_binding(&row);
        assert_eq!(staged.unit_suffix, None);
        assert_eq!(staged.property_name, None);
        assert_eq!(staged.address_pid.as_deref(), Some("2077263"));
        assert_eq!(staged.address, "U36/148C Walker Street Townsville City QLD");
    }
}
