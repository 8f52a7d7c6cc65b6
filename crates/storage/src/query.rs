#![forbid(unsafe_code)]
//! Composable SQL building blocks.
//!
//! Conditions form a WHERE tree; the builder renders `?` placeholders and
//! keeps the bound values alongside the SQL text so that executed statements
//! can be recorded and replayed verbatim by the deadlock recovery path.

use rusqlite::types::Value;

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOperator {
    Equals,
    NotEquals,
    Is,
    IsNot,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    In,
    NotIn,
    Like,
}

impl CompareOperator {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::NotEquals => "<>",
            Self::Is => "IS",
            Self::IsNot => "IS NOT",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Like => "LIKE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicOperator {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

pub fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

pub fn integer(value: i64) -> Value {
    Value::Integer(value)
}

pub fn boolean(value: bool) -> Value {
    Value::Integer(value as i64)
}

pub fn blob(value: Vec<u8>) -> Value {
    Value::Blob(value)
}

#[derive(Clone, Debug)]
enum ConditionPart {
    Value {
        column: String,
        op: CompareOperator,
        value: Value,
    },
    ValueList {
        column: String,
        op: CompareOperator,
        values: Vec<Value>,
    },
    Column {
        column: String,
        op: CompareOperator,
        other: String,
    },
    Sub(Condition),
}

/// A WHERE condition tree.
#[derive(Clone, Debug)]
pub struct Condition {
    combine: LogicOperator,
    parts: Vec<ConditionPart>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new(LogicOperator::And)
    }
}

impl Condition {
    pub fn new(combine: LogicOperator) -> Self {
        Self {
            combine,
            parts: Vec::new(),
        }
    }

    pub fn add_value_condition(&mut self, column: &str, op: CompareOperator, value: Value) {
        self.parts.push(ConditionPart::Value {
            column: column.to_string(),
            op,
            value,
        });
    }

    /// `IN`/`NOT IN` against a value list.
    pub fn add_value_list_condition(
        &mut self,
        column: &str,
        op: CompareOperator,
        values: Vec<Value>,
    ) {
        self.parts.push(ConditionPart::ValueList {
            column: column.to_string(),
            op,
            values,
        });
    }

    pub fn add_column_condition(&mut self, column: &str, op: CompareOperator, other: &str) {
        self.parts.push(ConditionPart::Column {
            column: column.to_string(),
            op,
            other: other.to_string(),
        });
    }

    pub fn add_condition(&mut self, condition: Condition) {
        self.parts.push(ConditionPart::Sub(condition));
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        let combiner = match self.combine {
            LogicOperator::And => " AND ",
            LogicOperator::Or => " OR ",
        };
        for (index, part) in self.parts.iter().enumerate() {
            if index > 0 {
                sql.push_str(combiner);
            }
            match part {
                ConditionPart::Value { column, op, value } => {
                    if matches!(op, CompareOperator::Is | CompareOperator::IsNot)
                        && matches!(value, Value::Null)
                    {
                        sql.push_str(column);
                        sql.push(' ');
                        sql.push_str(op.as_sql());
                        sql.push_str(" NULL");
                    } else {
                        sql.push_str(column);
                        sql.push(' ');
                        sql.push_str(op.as_sql());
                        sql.push_str(" ?");
                        params.push(value.clone());
                    }
                }
                ConditionPart::ValueList { column, op, values } => {
                    if values.is_empty() {
                        // An empty IN set can never match; NOT IN always does.
                        sql.push_str(match op {
                            CompareOperator::NotIn => "1=1",
                            _ => "1=0",
                        });
                        continue;
                    }
                    sql.push_str(column);
                    sql.push(' ');
                    sql.push_str(op.as_sql());
                    sql.push_str(" (");
                    for (i, value) in values.iter().enumerate() {
                        if i > 0 {
                            sql.push_str(", ");
                        }
                        sql.push('?');
                        params.push(value.clone());
                    }
                    sql.push(')');
                }
                ConditionPart::Column { column, op, other } => {
                    sql.push_str(column);
                    sql.push(' ');
                    sql.push_str(op.as_sql());
                    sql.push(' ');
                    sql.push_str(other);
                }
                ConditionPart::Sub(sub) => {
                    sql.push('(');
                    sub.render(sql, params);
                    sql.push(')');
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryMode {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

/// Builds one SQL statement plus its bound parameter values.
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    table: String,
    mode: QueryMode,
    columns: Vec<String>,
    joins: Vec<(JoinType, String, String, String)>,
    condition: Condition,
    sets: Vec<(String, Value)>,
    insert_columns: Vec<(String, Vec<Value>)>,
    order_by: Vec<(String, SortOrder)>,
}

impl QueryBuilder {
    pub fn new(table: &str, mode: QueryMode) -> Self {
        Self {
            table: table.to_string(),
            mode,
            columns: Vec::new(),
            joins: Vec::new(),
            condition: Condition::default(),
            sets: Vec::new(),
            insert_columns: Vec::new(),
            order_by: Vec::new(),
        }
    }

    pub fn add_column(&mut self, column: &str) {
        self.columns.push(column.to_string());
    }

    pub fn add_join(&mut self, join: JoinType, table: &str, left: &str, right: &str) {
        self.joins
            .push((join, table.to_string(), left.to_string(), right.to_string()));
    }

    pub fn add_value_condition(&mut self, column: &str, op: CompareOperator, value: Value) {
        self.condition.add_value_condition(column, op, value);
    }

    pub fn add_value_list_condition(
        &mut self,
        column: &str,
        op: CompareOperator,
        values: Vec<Value>,
    ) {
        self.condition.add_value_list_condition(column, op, values);
    }

    pub fn add_condition(&mut self, condition: Condition) {
        self.condition.add_condition(condition);
    }

    /// Update: one value per column. Insert: one value per column per row;
    /// all column arrays must have the same length.
    pub fn set_column_value(&mut self, column: &str, value: Value) {
        self.sets.push((column.to_string(), value));
    }

    pub fn set_column_values(&mut self, column: &str, values: Vec<Value>) {
        self.insert_columns.push((column.to_string(), values));
    }

    pub fn order_by(&mut self, column: &str, order: SortOrder) {
        self.order_by.push((column.to_string(), order));
    }

    pub fn build(&self) -> Result<(String, Vec<Value>), StoreError> {
        let mut sql = String::new();
        let mut params = Vec::new();
        match self.mode {
            QueryMode::Select => {
                sql.push_str("SELECT ");
                if self.columns.is_empty() {
                    sql.push('*');
                } else {
                    sql.push_str(&self.columns.join(", "));
                }
                sql.push_str(" FROM ");
                sql.push_str(&self.table);
                for (join, table, left, right) in &self.joins {
                    sql.push_str(match join {
                        JoinType::Inner => " INNER JOIN ",
                        JoinType::Left => " LEFT JOIN ",
                    });
                    sql.push_str(table);
                    sql.push_str(" ON ");
                    sql.push_str(left);
                    sql.push_str(" = ");
                    sql.push_str(right);
                }
                self.render_where(&mut sql, &mut params);
                for (index, (column, order)) in self.order_by.iter().enumerate() {
                    sql.push_str(if index == 0 { " ORDER BY " } else { ", " });
                    sql.push_str(column);
                    if *order == SortOrder::Descending {
                        sql.push_str(" DESC");
                    }
                }
            }
            QueryMode::Insert => {
                if self.insert_columns.is_empty() {
                    return Err(StoreError::InvalidInput("insert without columns"));
                }
                let rows = self.insert_columns[0].1.len();
                if self
                    .insert_columns
                    .iter()
                    .any(|(_, values)| values.len() != rows)
                {
                    return Err(StoreError::InvalidInput(
                        "insert column arrays differ in length",
                    ));
                }
                sql.push_str("INSERT INTO ");
                sql.push_str(&self.table);
                sql.push_str(" (");
                sql.push_str(
                    &self
                        .insert_columns
                        .iter()
                        .map(|(column, _)| column.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                );
                sql.push_str(") VALUES ");
                for row in 0..rows {
                    if row > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('(');
                    for (index, (_, values)) in self.insert_columns.iter().enumerate() {
                        if index > 0 {
                            sql.push_str(", ");
                        }
                        sql.push('?');
                        params.push(values[row].clone());
                    }
                    sql.push(')');
                }
            }
            QueryMode::Update => {
                if self.sets.is_empty() {
                    return Err(StoreError::InvalidInput("update without columns"));
                }
                sql.push_str("UPDATE ");
                sql.push_str(&self.table);
                sql.push_str(" SET ");
                for (index, (column, value)) in self.sets.iter().enumerate() {
                    if index > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(column);
                    sql.push_str(" = ?");
                    params.push(value.clone());
                }
                self.render_where(&mut sql, &mut params);
            }
            QueryMode::Delete => {
                sql.push_str("DELETE FROM ");
                sql.push_str(&self.table);
                self.render_where(&mut sql, &mut params);
            }
        }
        Ok((sql, params))
    }

    fn render_where(&self, sql: &mut String, params: &mut Vec<Value>) {
        if !self.condition.is_empty() {
            sql.push_str(" WHERE ");
            self.condition.render(sql, params);
        }
    }
}
