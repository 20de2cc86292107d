use std::{collections::HashMap, time::Duration};

pub type Row = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    rows: Vec<Row>,
    runtime: Duration,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>, runtime: Duration) -> Self {
        Self { rows, runtime }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn runtime(&self) -> Duration {
        self.runtime
    }
}
