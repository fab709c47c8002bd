//! Host table abstraction.
//!
//! Plugins never touch a concrete table type. They drive a [`HostTable`]: a
//! grid of string cells addressed by data row index (stable across sorting)
//! and column index, plus per-cell attributes, a display order, row and column
//! visibility and a small custom event channel.

use crate::error::TableError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Address of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    /// Data row index, independent of the current display order
    pub row: usize,
    pub column: usize,
}

impl CellRef {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }
}

impl std::fmt::Display for CellRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.row, self.column)
    }
}

/// A custom event dispatched by a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEvent {
    pub name: String,
    pub detail: Value,
}

/// Identifier returned by [`HostTable::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type TableListener = Arc<dyn Fn(&TableEvent) + Send + Sync>;

/// The table surface plugins operate on.
///
/// Implementations use interior mutability and are shared as
/// `Arc<dyn HostTable>`.
pub trait HostTable: Send + Sync {
    fn id(&self) -> &str;
    fn headers(&self) -> Vec<String>;
    fn row_count(&self) -> usize;
    fn column_count(&self) -> usize;

    fn cell_value(&self, cell: CellRef) -> Result<String, TableError>;
    /// Writes a cell and returns the previous value.
    fn set_cell_value(&self, cell: CellRef, value: String) -> Result<String, TableError>;

    fn attribute(&self, cell: CellRef, name: &str) -> Option<String>;
    fn set_attribute(&self, cell: CellRef, name: &str, value: &str) -> Result<(), TableError>;
    fn remove_attribute(&self, cell: CellRef, name: &str) -> bool;

    /// Data row indices in display order.
    fn row_order(&self) -> Vec<usize>;
    /// Replaces the display order; `order` must be a permutation of all rows.
    fn set_row_order(&self, order: Vec<usize>) -> Result<(), TableError>;

    fn set_row_visible(&self, row: usize, visible: bool) -> Result<(), TableError>;
    fn is_row_visible(&self, row: usize) -> bool;
    fn set_column_visible(&self, column: usize, visible: bool) -> Result<(), TableError>;
    fn is_column_visible(&self, column: usize) -> bool;

    /// Bumped on every cell write.
    fn revision(&self) -> u64;

    fn emit(&self, name: &str, detail: Value);
    fn on(&self, name: &str, listener: TableListener) -> ListenerId;
    fn off(&self, id: ListenerId) -> bool;

    /// Index of the column with the given header.
    fn column_index(&self, header: &str) -> Option<usize> {
        self.headers().iter().position(|h| h == header)
    }
}

/// Serializable table contents, the input format of [`MemoryTable`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub id: String,
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

struct GridState {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    attributes: HashMap<(CellRef, String), String>,
    order: Vec<usize>,
    hidden_rows: HashSet<usize>,
    hidden_columns: HashSet<usize>,
}

impl GridState {
    fn check_cell(&self, cell: CellRef) -> Result<(), TableError> {
        if cell.row < self.rows.len() && cell.column < self.headers.len() {
            Ok(())
        } else {
            Err(TableError::CellOutOfRange {
                row: cell.row,
                column: cell.column,
            })
        }
    }
}

/// In-process [`HostTable`] backed by a vector of string rows.
pub struct MemoryTable {
    id: String,
    state: RwLock<GridState>,
    listeners: RwLock<Vec<(ListenerId, String, TableListener)>>,
    next_listener: AtomicU64,
    revision: AtomicU64,
}

impl MemoryTable {
    pub fn new(id: &str, headers: Vec<String>) -> Self {
        Self::from_data(TableData {
            id: id.to_string(),
            headers,
            rows: Vec::new(),
        })
    }

    /// Builds a table from data. Short rows are padded with empty cells and
    /// long rows truncated to the header width.
    pub fn from_data(data: TableData) -> Self {
        let width = data.headers.len();
        let rows: Vec<Vec<String>> = data
            .rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        let order = (0..rows.len()).collect();

        Self {
            id: data.id,
            state: RwLock::new(GridState {
                headers: data.headers,
                rows,
                attributes: HashMap::new(),
                order,
                hidden_rows: HashSet::new(),
                hidden_columns: HashSet::new(),
            }),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            revision: AtomicU64::new(0),
        }
    }

    pub fn push_row(&self, mut row: Vec<String>) -> usize {
        let mut state = self.state.write();
        row.resize(state.headers.len(), String::new());
        state.rows.push(row);
        let index = state.rows.len() - 1;
        state.order.push(index);
        self.revision.fetch_add(1, Ordering::SeqCst);
        index
    }

    /// Snapshot of the current contents in data order.
    pub fn to_data(&self) -> TableData {
        let state = self.state.read();
        TableData {
            id: self.id.clone(),
            headers: state.headers.clone(),
            rows: state.rows.clone(),
        }
    }

    /// Visible rows in display order, restricted to visible columns.
    pub fn visible_rows(&self) -> Vec<Vec<String>> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter(|row| !state.hidden_rows.contains(row))
            .map(|&row| {
                state.rows[row]
                    .iter()
                    .enumerate()
                    .filter(|(column, _)| !state.hidden_columns.contains(column))
                    .map(|(_, value)| value.clone())
                    .collect()
            })
            .collect()
    }

    /// Headers of visible columns.
    pub fn visible_headers(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .headers
            .iter()
            .enumerate()
            .filter(|(column, _)| !state.hidden_columns.contains(column))
            .map(|(_, header)| header.clone())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl HostTable for MemoryTable {
    fn id(&self) -> &str {
        &self.id
    }

    fn headers(&self) -> Vec<String> {
        self.state.read().headers.clone()
    }

    fn row_count(&self) -> usize {
        self.state.read().rows.len()
    }

    fn column_count(&self) -> usize {
        self.state.read().headers.len()
    }

    fn cell_value(&self, cell: CellRef) -> Result<String, TableError> {
        let state = self.state.read();
        state.check_cell(cell)?;
        Ok(state.rows[cell.row][cell.column].clone())
    }

    fn set_cell_value(&self, cell: CellRef, value: String) -> Result<String, TableError> {
        let mut state = self.state.write();
        state.check_cell(cell)?;
        let previous = std::mem::replace(&mut state.rows[cell.row][cell.column], value);
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(previous)
    }

    fn attribute(&self, cell: CellRef, name: &str) -> Option<String> {
        self.state
            .read()
            .attributes
            .get(&(cell, name.to_string()))
            .cloned()
    }

    fn set_attribute(&self, cell: CellRef, name: &str, value: &str) -> Result<(), TableError> {
        let mut state = self.state.write();
        state.check_cell(cell)?;
        state
            .attributes
            .insert((cell, name.to_string()), value.to_string());
        Ok(())
    }

    fn remove_attribute(&self, cell: CellRef, name: &str) -> bool {
        self.state
            .write()
            .attributes
            .remove(&(cell, name.to_string()))
            .is_some()
    }

    fn row_order(&self) -> Vec<usize> {
        self.state.read().order.clone()
    }

    fn set_row_order(&self, order: Vec<usize>) -> Result<(), TableError> {
        let mut state = self.state.write();
        let rows = state.rows.len();
        if order.len() != rows {
            return Err(TableError::InvalidRowOrder(format!(
                "expected {} rows, got {}",
                rows,
                order.len()
            )));
        }
        let mut seen = vec![false; rows];
        for &row in &order {
            if row >= rows || seen[row] {
                return Err(TableError::InvalidRowOrder(format!(
                    "row {} is out of range or repeated",
                    row
                )));
            }
            seen[row] = true;
        }
        state.order = order;
        Ok(())
    }

    fn set_row_visible(&self, row: usize, visible: bool) -> Result<(), TableError> {
        let mut state = self.state.write();
        if row >= state.rows.len() {
            return Err(TableError::RowOutOfRange(row));
        }
        if visible {
            state.hidden_rows.remove(&row);
        } else {
            state.hidden_rows.insert(row);
        }
        Ok(())
    }

    fn is_row_visible(&self, row: usize) -> bool {
        let state = self.state.read();
        row < state.rows.len() && !state.hidden_rows.contains(&row)
    }

    fn set_column_visible(&self, column: usize, visible: bool) -> Result<(), TableError> {
        let mut state = self.state.write();
        if column >= state.headers.len() {
            return Err(TableError::ColumnOutOfRange(column));
        }
        if visible {
            state.hidden_columns.remove(&column);
        } else {
            state.hidden_columns.insert(column);
        }
        Ok(())
    }

    fn is_column_visible(&self, column: usize) -> bool {
        let state = self.state.read();
        column < state.headers.len() && !state.hidden_columns.contains(&column)
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn emit(&self, name: &str, detail: Value) {
        let event = TableEvent {
            name: name.to_string(),
            detail,
        };
        // Snapshot so listeners may register or remove listeners themselves
        let listeners: Vec<TableListener> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, event_name, _)| event_name == name)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        trace!(table = %self.id, event = name, listeners = listeners.len(), "Table event");
        for listener in listeners {
            listener(&event);
        }
    }

    fn on(&self, name: &str, listener: TableListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .push((id, name.to_string(), listener));
        id
    }

    fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _, _)| *listener_id != id);
        listeners.len() != before
    }
}

impl std::fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryTable")
            .field("id", &self.id)
            .field("headers", &state.headers)
            .field("rows", &state.rows.len())
            .finish()
    }
}
