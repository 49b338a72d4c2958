//! Table output built on prettytable

use prettytable::{format, Cell, Row, Table};

/// Column style applied when colours are enabled (prettytable style spec)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStyle {
    Plain,
    Good,
    Bad,
    Warn,
    Key,
}

impl CellStyle {
    fn spec(self) -> &'static str {
        match self {
            CellStyle::Plain => "",
            CellStyle::Good => "Fg",
            CellStyle::Bad => "Fr",
            CellStyle::Warn => "Fy",
            CellStyle::Key => "Fcb",
        }
    }
}

/// A table builder for consistent formatting
#[derive(Debug, Default)]
pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<(String, CellStyle)>>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers<S: Into<String>>(mut self, headers: impl IntoIterator<Item = S>) -> Self {
        self.headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn add_row<S: Into<String>>(self, row: impl IntoIterator<Item = S>) -> Self {
        self.add_styled_row(row.into_iter().map(|cell| (cell.into(), CellStyle::Plain)))
    }

    pub fn add_styled_row(mut self, row: impl IntoIterator<Item = (String, CellStyle)>) -> Self {
        self.rows.push(row.into_iter().collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn table(&self, coloured: bool) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        if !self.headers.is_empty() {
            table.set_titles(Row::new(
                self.headers.iter().map(|h| Cell::new(h).style_spec("b")).collect(),
            ));
        }
        for row in &self.rows {
            table.add_row(Row::new(
                row.iter()
                    .map(|(text, style)| {
                        let cell = Cell::new(text);
                        if coloured {
                            cell.style_spec(style.spec())
                        } else {
                            cell
                        }
                    })
                    .collect(),
            ));
        }
        table
    }

    /// Plain rendering, indented two spaces
    pub fn build(&self) -> String {
        if self.headers.is_empty() && self.rows.is_empty() {
            return String::new();
        }
        let mut result = String::new();
        for line in self.table(false).to_string().lines() {
            result.push_str("  ");
            result.push_str(line.trim_end());
            result.push('\n');
        }
        result
    }

    /// Print to stdout, styled when `coloured` is set
    pub fn print(&self, coloured: bool) {
        if coloured {
            self.table(true).printstd();
        } else {
            print!("{}", self.build());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_builder_basic() {
        let table = TableBuilder::new()
            .headers(["Plugin", "State"])
            .add_row(["alpha", "Running"])
            .add_styled_row(vec![("beta".to_string(), CellStyle::Plain), ("Failed".to_string(), CellStyle::Bad)])
            .build();

        assert!(table.contains("Plugin"));
        assert!(table.contains("alpha"));
        assert!(table.contains("Failed"));
        assert!(!table.contains("\x1b["));
        assert!(table.lines().all(|line| line.starts_with("  ")));
    }

    #[test]
    fn test_empty_table() {
        let table = TableBuilder::new();
        assert!(table.is_empty());
        assert!(table.build().is_empty());
    }
}
