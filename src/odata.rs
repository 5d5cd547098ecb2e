use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ApiError, ApiResult};
use crate::query_builder::{FilterOp, QueryBuilder};

/// Comparison operators of the supported `$filter` subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ODataOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl ODataOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "ge" => Some(Self::Ge),
            "lt" => Some(Self::Lt),
            "le" => Some(Self::Le),
            _ => None,
        }
    }

    fn to_filter_op(self) -> FilterOp {
        match self {
            Self::Eq => FilterOp::Eq,
            Self::Ne => FilterOp::Ne,
            Self::Gt => FilterOp::Gt,
            Self::Ge => FilterOp::Gte,
            Self::Lt => FilterOp::Lt,
            Self::Le => FilterOp::Lte,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ODataLiteral {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterClause {
    Compare { property: String, op: ODataOp, literal: ODataLiteral },
    Contains { property: String, literal: String },
}

/// Parsed OData query options.
#[derive(Debug, Default, Clone)]
pub struct ODataQuery {
    pub top: Option<u64>,
    pub skip: Option<u64>,
    pub count: bool,
    pub select: Option<Vec<String>>,
    pub orderby: Option<(String, bool)>,
    pub filter: Vec<FilterClause>,
}

/// Parse `$top`, `$skip`, `$count`, `$select`, `$orderby` and the `$filter`
/// subset from raw query parameters.
pub fn parse_query(params: &HashMap<String, String>) -> ApiResult<ODataQuery> {
    let mut query = ODataQuery::default();

    if let Some(raw) = params.get("$top") {
        query.top = Some(
            raw.parse::<u64>()
                .map_err(|_| ApiError::validation(format!("invalid $top value {raw:?}")))?,
        );
    }
    if let Some(raw) = params.get("$skip") {
        query.skip = Some(
            raw.parse::<u64>()
                .map_err(|_| ApiError::validation(format!("invalid $skip value {raw:?}")))?,
        );
    }
    if let Some(raw) = params.get("$count") {
        query.count = match raw.as_str() {
            "true" => true,
            "false" => false,
            other => {
                return Err(ApiError::validation(format!("invalid $count value {other:?}")));
            }
        };
    }
    if let Some(raw) = params.get("$select") {
        let fields: Vec<String> =
            raw.split(',').map(|f| f.trim().to_string()).filter(|f| !f.is_empty()).collect();
        if fields.is_empty() {
            return Err(ApiError::validation("$select must name at least one property"));
        }
        query.select = Some(fields);
    }
    if let Some(raw) = params.get("$orderby") {
        let mut parts = raw.split_whitespace();
        let property = parts
            .next()
            .ok_or_else(|| ApiError::validation("$orderby must name a property"))?
            .to_string();
        let descending = match parts.next() {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(other) => {
                return Err(ApiError::validation(format!(
                    "invalid $orderby direction {other:?}"
                )));
            }
        };
        query.orderby = Some((property, descending));
    }
    if let Some(raw) = params.get("$filter") {
        query.filter = parse_filter(raw)?;
    }
    Ok(query)
}

/// Split a filter on top-level ` and `, respecting single-quoted strings.
fn split_top_level_and(expr: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\'' {
            in_quotes = !in_quotes;
            current.push(chars[i]);
            i += 1;
            continue;
        }
        if !in_quotes
            && !current.is_empty()
            && i + 5 <= chars.len()
            && chars[i..].starts_with(&[' ', 'a', 'n', 'd', ' '])
        {
            clauses.push(current.trim().to_string());
            current = String::new();
            i += 5;
            continue;
        }
        current.push(chars[i]);
        i += 1;
    }
    if !current.trim().is_empty() {
        clauses.push(current.trim().to_string());
    }
    clauses
}

fn parse_literal(raw: &str) -> ApiResult<ODataLiteral> {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        let inner = &raw[1..raw.len() - 1];
        return Ok(ODataLiteral::Str(inner.replace("''", "'")));
    }
    raw.parse::<f64>()
        .map(ODataLiteral::Num)
        .map_err(|_| ApiError::validation(format!("invalid literal {raw:?} in $filter")))
}

fn parse_clause(clause: &str) -> ApiResult<FilterClause> {
    let lower = clause.to_lowercase();
    if lower.starts_with("contains(") && clause.ends_with(')') {
        let inner = &clause["contains(".len()..clause.len() - 1];
        let (property, literal) = inner.split_once(',').ok_or_else(|| {
            ApiError::validation(format!("malformed contains clause {clause:?}"))
        })?;
        let literal = match parse_literal(literal)? {
            ODataLiteral::Str(s) => s,
            ODataLiteral::Num(_) => {
                return Err(ApiError::validation("contains requires a string literal"));
            }
        };
        return Ok(FilterClause::Contains { property: property.trim().to_string(), literal });
    }

    // `Property op literal`; the literal may contain spaces inside quotes
    let mut parts = clause.splitn(3, ' ');
    let (Some(property), Some(op_token), Some(literal)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(ApiError::validation(format!("malformed $filter clause {clause:?}")));
    };
    let op = ODataOp::parse(op_token).ok_or_else(|| {
        ApiError::validation(format!("unsupported operator {op_token:?} in $filter"))
    })?;
    Ok(FilterClause::Compare {
        property: property.to_string(),
        op,
        literal: parse_literal(literal)?,
    })
}

pub fn parse_filter(expr: &str) -> ApiResult<Vec<FilterClause>> {
    split_top_level_and(expr).iter().map(|c| parse_clause(c)).collect()
}

/// Top-level `DatasetId eq '…'` clause, required for the Observations set.
pub fn extract_dataset_id(clauses: &[FilterClause]) -> Option<String> {
    clauses.iter().find_map(|clause| match clause {
        FilterClause::Compare {
            property,
            op: ODataOp::Eq,
            literal: ODataLiteral::Str(value),
        } if property == "DatasetId" => Some(value.clone()),
        _ => None,
    })
}

/// Translate filter clauses onto a query builder using an OData-property →
/// column map. Unknown properties are rejected.
fn lookup_column<'a>(field_map: &[(&str, &'a str)], property: &str) -> ApiResult<&'a str> {
    field_map
        .iter()
        .find(|(odata, _)| *odata == property)
        .map(|(_, column)| *column)
        .ok_or_else(|| ApiError::validation(format!("unknown property {property:?}")))
}

pub fn apply_filter_to_builder(
    mut builder: QueryBuilder,
    clauses: &[FilterClause],
    field_map: &[(&str, &str)],
) -> ApiResult<QueryBuilder> {
    let lookup = |property: &str| lookup_column(field_map, property);
    for clause in clauses {
        builder = match clause {
            FilterClause::Compare { property, op, literal } => {
                let column = lookup(property)?;
                match literal {
                    ODataLiteral::Str(s) => {
                        builder.filter(column, op.to_filter_op(), s.as_str())
                    }
                    ODataLiteral::Num(n) => {
                        // integral numerics bind as integers for typed columns
                        if n.fract() == 0.0 {
                            builder.filter(column, op.to_filter_op(), *n as i64)
                        } else {
                            builder.filter(column, op.to_filter_op(), *n)
                        }
                    }
                }
            }
            FilterClause::Contains { property, literal } => {
                let column = lookup(property)?;
                let escaped = literal.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
                builder.filter(column, FilterOp::ILike, format!("%{escaped}%"))
            }
        };
    }
    Ok(builder)
}

pub fn apply_orderby_to_builder(
    builder: QueryBuilder,
    orderby: &Option<(String, bool)>,
    field_map: &[(&str, &str)],
) -> ApiResult<QueryBuilder> {
    let Some((property, descending)) = orderby else {
        return Ok(builder);
    };
    let column = lookup_column(field_map, property)?;
    Ok(builder.order_by(column, *descending))
}

// ── In-memory evaluation (metadata-backed entity sets) ──

fn json_matches(record: &Value, clause: &FilterClause) -> bool {
    match clause {
        FilterClause::Compare { property, op, literal } => {
            let Some(field) = record.get(property) else { return false };
            match literal {
                ODataLiteral::Num(n) => {
                    let Some(value) = field.as_f64() else { return false };
                    match op {
                        ODataOp::Eq => value == *n,
                        ODataOp::Ne => value != *n,
                        ODataOp::Gt => value > *n,
                        ODataOp::Ge => value >= *n,
                        ODataOp::Lt => value < *n,
                        ODataOp::Le => value <= *n,
                    }
                }
                ODataLiteral::Str(s) => {
                    let Some(value) = field.as_str() else { return false };
                    match op {
                        ODataOp::Eq => value == s,
                        ODataOp::Ne => value != s,
                        ODataOp::Gt => value > s.as_str(),
                        ODataOp::Ge => value >= s.as_str(),
                        ODataOp::Lt => value < s.as_str(),
                        ODataOp::Le => value <= s.as_str(),
                    }
                }
            }
        }
        FilterClause::Contains { property, literal } => record
            .get(property)
            .and_then(Value::as_str)
            .is_some_and(|value| value.to_lowercase().contains(&literal.to_lowercase())),
    }
}

/// Apply filter/orderby/skip/top/select to already materialized records.
/// Returns `(rows, total_before_paging)`.
pub fn apply_in_memory(records: Vec<Value>, query: &ODataQuery) -> (Vec<Value>, u64) {
    let mut rows: Vec<Value> = records
        .into_iter()
        .filter(|r| query.filter.iter().all(|clause| json_matches(r, clause)))
        .collect();

    if let Some((property, descending)) = &query.orderby {
        rows.sort_by(|a, b| {
            let av = a.get(property);
            let bv = b.get(property);
            let ordering = match (av.and_then(Value::as_f64), bv.and_then(Value::as_f64)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                _ => {
                    let ax = av.and_then(Value::as_str).unwrap_or("");
                    let bx = bv.and_then(Value::as_str).unwrap_or("");
                    ax.cmp(bx)
                }
            };
            if *descending { ordering.reverse() } else { ordering }
        });
    }

    let total = rows.len() as u64;
    let skip = query.skip.unwrap_or(0) as usize;
    let rows: Vec<Value> = rows
        .into_iter()
        .skip(skip)
        .take(query.top.map(|t| t as usize).unwrap_or(usize::MAX))
        .map(|row| project(row, &query.select))
        .collect();
    (rows, total)
}

fn project(row: Value, select: &Option<Vec<String>>) -> Value {
    let Some(fields) = select else { return row };
    let Value::Object(map) = row else { return row };
    let projected: serde_json::Map<String, Value> = map
        .into_iter()
        .filter(|(key, _)| fields.iter().any(|f| f == key))
        .collect();
    Value::Object(projected)
}

// ── Service document & CSDL metadata ──

pub fn service_document(base_url: &str) -> Value {
    serde_json::json!({
        "@odata.context": format!("{base_url}/$metadata"),
        "value": [
            { "name": "Datasets", "kind": "EntitySet", "url": "Datasets" },
            { "name": "Observations", "kind": "EntitySet", "url": "Observations" },
            { "name": "Territories", "kind": "EntitySet", "url": "Territories" },
            { "name": "Measures", "kind": "EntitySet", "url": "Measures" },
        ]
    })
}

/// CSDL document for `$metadata`. Static: the entity model only changes with
/// the code.
pub fn csdl_metadata() -> &'static str {
    r#"<?xml version="1.0" encoding="utf-8"?>
<edmx:Edmx xmlns:edmx="http://docs.oasis-open.org/odata/ns/edmx" Version="4.0">
  <edmx:DataServices>
    <Schema xmlns="http://docs.oasis-open.org/odata/ns/edm" Namespace="OsservatorioIstat">
      <EntityType Name="Dataset">
        <Key><PropertyRef Name="DatasetId"/></Key>
        <Property Name="DatasetId" Type="Edm.String" Nullable="false"/>
        <Property Name="Name" Type="Edm.String"/>
        <Property Name="Category" Type="Edm.String"/>
        <Property Name="Description" Type="Edm.String"/>
        <Property Name="Agency" Type="Edm.String"/>
        <Property Name="Priority" Type="Edm.Int32"/>
        <Property Name="Status" Type="Edm.String"/>
        <Property Name="HasAnalyticsData" Type="Edm.Boolean"/>
        <Property Name="RecordCount" Type="Edm.Int64"/>
      </EntityType>
      <EntityType Name="Observation">
        <Key>
          <PropertyRef Name="DatasetId"/>
          <PropertyRef Name="TimePeriod"/>
          <PropertyRef Name="TerritoryCode"/>
          <PropertyRef Name="MeasureCode"/>
        </Key>
        <Property Name="DatasetId" Type="Edm.String" Nullable="false"/>
        <Property Name="Year" Type="Edm.Int32"/>
        <Property Name="TimePeriod" Type="Edm.String" Nullable="false"/>
        <Property Name="TerritoryCode" Type="Edm.String" Nullable="false"/>
        <Property Name="TerritoryName" Type="Edm.String"/>
        <Property Name="MeasureCode" Type="Edm.String" Nullable="false"/>
        <Property Name="MeasureName" Type="Edm.String"/>
        <Property Name="ObsValue" Type="Edm.Double" Nullable="true"/>
        <Property Name="ObsStatus" Type="Edm.String"/>
      </EntityType>
      <EntityType Name="Territory">
        <Key><PropertyRef Name="TerritoryCode"/></Key>
        <Property Name="TerritoryCode" Type="Edm.String" Nullable="false"/>
        <Property Name="TerritoryName" Type="Edm.String"/>
        <Property Name="ObservationCount" Type="Edm.Int64"/>
      </EntityType>
      <EntityType Name="Measure">
        <Key><PropertyRef Name="MeasureCode"/></Key>
        <Property Name="MeasureCode" Type="Edm.String" Nullable="false"/>
        <Property Name="MeasureName" Type="Edm.String"/>
        <Property Name="ObservationCount" Type="Edm.Int64"/>
      </EntityType>
      <EntityContainer Name="Container">
        <EntitySet Name="Datasets" EntityType="OsservatorioIstat.Dataset"/>
        <EntitySet Name="Observations" EntityType="OsservatorioIstat.Observation"/>
        <EntitySet Name="Territories" EntityType="OsservatorioIstat.Territory"/>
        <EntitySet Name="Measures" EntityType="OsservatorioIstat.Measure"/>
      </EntityContainer>
    </Schema>
  </edmx:DataServices>
</edmx:Edmx>"#
}

/// OData property → columnar store column, for the Observations entity set.
pub const OBSERVATION_FIELDS: &[(&str, &str)] = &[
    ("DatasetId", "dataset_id"),
    ("Year", "year"),
    ("TimePeriod", "time_period"),
    ("TerritoryCode", "territory_code"),
    ("TerritoryName", "territory_name"),
    ("MeasureCode", "measure_code"),
    ("MeasureName", "measure_name"),
    ("ObsValue", "obs_value"),
    ("ObsStatus", "obs_status"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_paging_count_select_orderby() {
        let q = parse_query(&params(&[
            ("$top", "5"),
            ("$skip", "10"),
            ("$count", "true"),
            ("$select", "DatasetId,Name"),
            ("$orderby", "Name desc"),
        ]))
        .unwrap();
        assert_eq!(q.top, Some(5));
        assert_eq!(q.skip, Some(10));
        assert!(q.count);
        assert_eq!(q.select.as_deref(), Some(&["DatasetId".to_string(), "Name".to_string()][..]));
        assert_eq!(q.orderby, Some(("Name".to_string(), true)));
    }

    #[test]
    fn rejects_bad_paging_values() {
        assert!(parse_query(&params(&[("$top", "-1")])).is_err());
        assert!(parse_query(&params(&[("$top", "abc")])).is_err());
        assert!(parse_query(&params(&[("$count", "yes")])).is_err());
        assert!(parse_query(&params(&[("$orderby", "Name sideways")])).is_err());
    }

    #[test]
    fn parses_comparison_filters() {
        let clauses = parse_filter("Year eq 2023").unwrap();
        assert_eq!(
            clauses,
            vec![FilterClause::Compare {
                property: "Year".to_string(),
                op: ODataOp::Eq,
                literal: ODataLiteral::Num(2023.0),
            }]
        );

        let clauses =
            parse_filter("DatasetId eq 'DCIS_POPRES1' and Year ge 2020").unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(extract_dataset_id(&clauses).as_deref(), Some("DCIS_POPRES1"));
    }

    #[test]
    fn quoted_and_inside_literal_is_not_a_separator() {
        let clauses = parse_filter("Name eq 'salt and pepper' and Year lt 2020").unwrap();
        assert_eq!(clauses.len(), 2);
        match &clauses[0] {
            FilterClause::Compare { literal: ODataLiteral::Str(s), .. } => {
                assert_eq!(s, "salt and pepper");
            }
            other => panic!("unexpected clause {other:?}"),
        }
    }

    #[test]
    fn parses_contains() {
        let clauses = parse_filter("contains(TerritoryName,'lombar')").unwrap();
        assert_eq!(
            clauses,
            vec![FilterClause::Contains {
                property: "TerritoryName".to_string(),
                literal: "lombar".to_string(),
            }]
        );
        assert!(parse_filter("contains(Year,5)").is_err());
    }

    #[test]
    fn rejects_unsupported_operators() {
        assert!(parse_filter("Year foo 2023").is_err());
        assert!(parse_filter("Year eq banana").is_err());
        assert!(parse_filter("justoneword").is_err());
    }

    #[test]
    fn dataset_id_extraction_requires_eq_on_dataset_id() {
        let clauses = parse_filter("Year eq 2023").unwrap();
        assert_eq!(extract_dataset_id(&clauses), None);
        let clauses = parse_filter("DatasetId ne 'X'").unwrap();
        assert_eq!(extract_dataset_id(&clauses), None);
    }

    #[test]
    fn filter_translates_to_builder_sql() {
        let clauses =
            parse_filter("DatasetId eq 'DCIS_POPRES1' and Year ge 2020").unwrap();
        let builder = crate::query_builder::observations().select(&["dataset_id", "obs_value"]);
        let builder = apply_filter_to_builder(builder, &clauses, OBSERVATION_FIELDS).unwrap();
        let (sql, params) = builder.build_sql().unwrap();
        assert!(sql.contains("dataset_id = ?"));
        assert!(sql.contains("year >= ?"));
        assert_eq!(sql.matches('?').count(), params.len());
    }

    #[test]
    fn contains_translates_to_ilike() {
        let clauses = parse_filter("contains(TerritoryName,'lombar')").unwrap();
        let builder = crate::query_builder::observations().select(&["territory_name"]);
        let builder = apply_filter_to_builder(builder, &clauses, OBSERVATION_FIELDS).unwrap();
        let (sql, params) = builder.build_sql().unwrap();
        assert!(sql.contains("territory_name ILIKE ?"));
        assert_eq!(
            params,
            vec![crate::query_builder::SqlValue::Str("%lombar%".to_string())]
        );
    }

    #[test]
    fn unknown_property_is_rejected() {
        let clauses = parse_filter("Nope eq 'x'").unwrap();
        let builder = crate::query_builder::observations().select(&["dataset_id"]);
        let err = apply_filter_to_builder(builder, &clauses, OBSERVATION_FIELDS).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn in_memory_filter_orderby_paging_select() {
        let records = vec![
            json!({ "DatasetId": "A", "Category": "popolazione", "Priority": 3 }),
            json!({ "DatasetId": "B", "Category": "economia", "Priority": 9 }),
            json!({ "DatasetId": "C", "Category": "popolazione", "Priority": 7 }),
            json!({ "DatasetId": "D", "Category": "popolazione", "Priority": 1 }),
        ];
        let query = ODataQuery {
            top: Some(2),
            skip: Some(1),
            count: true,
            select: Some(vec!["DatasetId".to_string()]),
            orderby: Some(("Priority".to_string(), true)),
            filter: parse_filter("Category eq 'popolazione'").unwrap(),
        };
        let (rows, total) = apply_in_memory(records, &query);
        assert_eq!(total, 3);
        // ordered desc by priority: C(7), then D(1) after skipping A... order
        // is [C:7, A:3, D:1], skip 1 → [A, D], projected to DatasetId only
        assert_eq!(rows, vec![json!({ "DatasetId": "A" }), json!({ "DatasetId": "D" })]);
    }

    #[test]
    fn in_memory_contains_is_case_insensitive() {
        let records = vec![
            json!({ "TerritoryName": "Lombardia" }),
            json!({ "TerritoryName": "Lazio" }),
        ];
        let query = ODataQuery {
            filter: parse_filter("contains(TerritoryName,'LOMBAR')").unwrap(),
            ..Default::default()
        };
        let (rows, total) = apply_in_memory(records, &query);
        assert_eq!(total, 1);
        assert_eq!(rows[0]["TerritoryName"], "Lombardia");
    }

    #[test]
    fn top_zero_returns_no_rows_but_counts() {
        let records = vec![json!({ "DatasetId": "A" })];
        let query = ODataQuery { top: Some(0), ..Default::default() };
        let (rows, total) = apply_in_memory(records, &query);
        assert!(rows.is_empty());
        assert_eq!(total, 1);
    }

    #[test]
    fn service_document_lists_entity_sets() {
        let doc = service_document("http://localhost:8000/odata");
        assert_eq!(doc["@odata.context"], "http://localhost:8000/odata/$metadata");
        let names: Vec<&str> =
            doc["value"].as_array().unwrap().iter().map(|v| v["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Datasets", "Observations", "Territories", "Measures"]);
    }

    #[test]
    fn csdl_declares_all_entity_types() {
        let xml = csdl_metadata();
        for entity in ["Dataset", "Observation", "Territory", "Measure"] {
            assert!(xml.contains(&format!("EntityType Name=\"{entity}\"")));
        }
        assert!(xml.starts_with("<?xml"));
    }
}
