use std::fmt;

use crate::arrays::datatype::DataType;
use crate::arrays::scalar::{OwnedScalarValue, ScalarValue};

/// Reference to a column of the input table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnExpr {
    pub table_id: u32,
    /// Index of the column in the table.
    pub column_idx: usize,
    pub datatype: DataType,
}

impl fmt::Display for ColumnExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{} ({})", self.table_id, self.column_idx, self.datatype)
    }
}

/// A single input to a table function.
#[derive(Debug, Clone, PartialEq)]
pub enum InputExpr {
    Column(ColumnExpr),
    Constant(OwnedScalarValue),
    /// Some other expression that was not reduced to a column or a constant
    /// during planning. Holds a description for error messages.
    Unresolved(String),
}

impl InputExpr {
    pub fn column(table_id: u32, column_idx: usize, datatype: DataType) -> Self {
        InputExpr::Column(ColumnExpr {
            table_id,
            column_idx,
            datatype,
        })
    }

    pub fn constant<'a>(value: impl Into<ScalarValue<'a>>) -> Self {
        InputExpr::Constant(value.into().into_owned())
    }
}

impl fmt::Display for InputExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(col) => write!(f, "{col}"),
            Self::Constant(v) => write!(f, "{v}"),
            Self::Unresolved(desc) => write!(f, "{desc}"),
        }
    }
}
