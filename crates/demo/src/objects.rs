//! External objects of the demo: what users write.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use drover_core::{Error, Result};
use drover_objectbase::{Object, ObjectMeta};
use drover_processing::{ExternalObject, ExternalStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub value: i64,
}

/// How an operator combines its operands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Add,
    Sub,
    Mul,
    Max,
}

impl Operation {
    /// Fold `operands` left to right. `None` on overflow or when an operation
    /// without neutral element gets no operands.
    #[must_use]
    pub fn apply(self, operands: &[i64]) -> Option<i64> {
        match self {
            Self::Add => operands.iter().try_fold(0_i64, |acc, v| acc.checked_add(*v)),
            Self::Mul => operands.iter().try_fold(1_i64, |acc, v| acc.checked_mul(*v)),
            Self::Sub => {
                let (first, rest) = operands.split_first()?;
                rest.iter().try_fold(*first, |acc, v| acc.checked_sub(*v))
            }
            Self::Max => operands.iter().copied().max(),
        }
    }

    #[must_use]
    pub const fn needs_operands(self) -> bool {
        matches!(self, Self::Sub | Self::Max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSpec {
    /// Names of the values in the operator's namespace.
    pub operands: Vec<String>,
    #[serde(default)]
    pub operation: Operation,
}

macro_rules! external {
    ($name:ident, $spec:ty) => {
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        pub struct $name {
            pub meta: ObjectMeta,
            pub spec: $spec,
            #[serde(default)]
            pub status: ExternalStatus,
        }

        impl Object for $name {
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }

        impl ExternalObject for $name {
            fn external_state(&self) -> Result<Json> {
                serde_json::to_value(&self.spec).map_err(|e| Error::serialization(e.to_string()))
            }

            fn external_status(&self) -> &ExternalStatus {
                &self.status
            }

            fn external_status_mut(&mut self) -> &mut ExternalStatus {
                &mut self.status
            }
        }
    };
}

external!(Value, ValueSpec);
external!(Operator, OperatorSpec);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operations() {
        assert_eq!(Operation::Add.apply(&[5, 6]), Some(11));
        assert_eq!(Operation::Sub.apply(&[5, 6, 1]), Some(-2));
        assert_eq!(Operation::Mul.apply(&[]), Some(1));
        assert_eq!(Operation::Max.apply(&[3, 9, 4]), Some(9));
        assert_eq!(Operation::Max.apply(&[]), None);
        assert_eq!(Operation::Add.apply(&[i64::MAX, 1]), None);
    }

    #[test]
    fn test_operator_spec_defaults_to_add() {
        let spec: OperatorSpec = serde_json::from_value(json!({"operands": ["a"]})).unwrap();
        assert_eq!(spec.operation, Operation::Add);
        let spec: OperatorSpec =
            serde_json::from_value(json!({"operands": [], "operation": "max"})).unwrap();
        assert!(spec.operation.needs_operands());
    }
}
