use tfexec_error::{DbError, Result, not_implemented};

use crate::arrays::datatype::DataType;
use crate::expr::InputExpr;

/// How output storage is sized before the kernel runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputRowSizing {
    /// Output capacity is the input row count scaled by this factor.
    RowMultiplier(f64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub name: String,
    pub datatype: DataType,
}

impl OutputColumn {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        OutputColumn {
            name: name.into(),
            datatype,
        }
    }
}

/// A planned table function invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TableFunctionExecutionUnit {
    /// Name of the function, used in logs and errors.
    pub name: String,
    /// Inputs in the order the kernel expects them.
    pub input_exprs: Vec<InputExpr>,
    /// Output columns, one output buffer per column.
    pub output_exprs: Vec<OutputColumn>,
    pub output_row_sizing: Option<OutputRowSizing>,
}

/// A horizontal partition of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub fragment_id: u32,
    pub num_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputTableInfo {
    pub table_id: u32,
    pub fragments: Vec<FragmentInfo>,
}

impl InputTableInfo {
    /// Get the single fragment this invocation runs over.
    ///
    /// Table functions execute over exactly one fragment. Splitting work across
    /// fragments (and devices) would need to happen above this layer.
    pub fn single_fragment(&self) -> Result<&FragmentInfo> {
        match self.fragments.as_slice() {
            [fragment] => Ok(fragment),
            [] => Err(DbError::internal("Table function input has no fragments")
                .with_field("table_id", self.table_id)),
            many => not_implemented!(
                "table function execution over {} fragments",
                many.len()
            ),
        }
    }
}
