use evalexpr::{
    eval_with_context, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
};
use gatecore::{ExpressionError, Value, Variables};
use tracing::debug;

/// Evaluates sequence flow conditions, correlation keys and payload mappings
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate_condition(
        &self,
        expression: &str,
        variables: &Variables,
    ) -> Result<bool, ExpressionError>;

    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<Value, ExpressionError>;
}

/// [`ExpressionEvaluator`] backed by `evalexpr`.
///
/// A bare variable path such as `order.id` resolves directly against the
/// payload, so objects and arrays can be mapped as a whole.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalexprEvaluator;

impl EvalexprEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn context(variables: &Variables) -> HashMapContext<DefaultNumericTypes> {
        let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
        for (name, value) in variables {
            let eval_val = match value {
                Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
                Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                    Some(evalexpr::Value::Int(*n as i64))
                }
                Value::Number(n) => Some(evalexpr::Value::Float(*n)),
                Value::String(s) => Some(evalexpr::Value::String(s.clone())),
                // objects, arrays and null are only reachable as bare paths
                Value::Null | Value::Array(_) | Value::Object(_) => None,
            };
            let Some(eval_val) = eval_val else {
                continue;
            };
            if let Err(e) = ctx.set_value(name.clone(), eval_val) {
                debug!(variable = %name, error = %e, "Variable not bound for evaluation");
            }
        }
        ctx
    }

    fn is_path(expression: &str) -> bool {
        !expression.is_empty()
            && expression
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
            && !expression.starts_with(|c: char| c.is_ascii_digit())
            && !matches!(expression, "true" | "false")
    }
}

impl ExpressionEvaluator for EvalexprEvaluator {
    fn evaluate_condition(
        &self,
        expression: &str,
        variables: &Variables,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, variables)? {
            Value::Bool(b) => Ok(b),
            _ => Err(ExpressionError::NotBoolean(expression.to_string())),
        }
    }

    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<Value, ExpressionError> {
        let expression = expression.trim();
        if Self::is_path(expression) {
            if let Some(value) = Value::lookup(variables, expression) {
                return Ok(value.clone());
            }
        }

        let ctx = Self::context(variables);
        let result = eval_with_context(expression, &ctx).map_err(|e| {
            ExpressionError::Evaluation {
                expression: expression.to_string(),
                message: e.to_string(),
            }
        })?;

        match result {
            evalexpr::Value::String(s) => Ok(Value::String(s)),
            evalexpr::Value::Int(i) => Ok(Value::Number(i as f64)),
            evalexpr::Value::Float(f) => Ok(Value::Number(f)),
            evalexpr::Value::Boolean(b) => Ok(Value::Bool(b)),
            evalexpr::Value::Empty => Ok(Value::Null),
            _ => Err(ExpressionError::UnsupportedValue(expression.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(foo: f64) -> Variables {
        let mut variables = Variables::new();
        variables.insert("foo".into(), Value::Number(foo));
        variables.insert("orderId".into(), Value::from("order-123"));
        variables
    }

    #[test]
    fn evaluates_numeric_conditions() {
        let evaluator = EvalexprEvaluator::new();
        assert_eq!(evaluator.evaluate_condition("foo < 5", &vars(4.0)), Ok(true));
        assert_eq!(
            evaluator.evaluate_condition("foo >= 5 && foo < 10", &vars(8.0)),
            Ok(true)
        );
        assert_eq!(evaluator.evaluate_condition("foo < 5", &vars(12.0)), Ok(false));
        assert_eq!(evaluator.evaluate_condition("foo < 5", &vars(4.5)), Ok(true));
    }

    #[test]
    fn missing_variables_fail_evaluation() {
        let evaluator = EvalexprEvaluator::new();
        assert!(matches!(
            evaluator.evaluate_condition("bar > 1", &vars(1.0)),
            Err(ExpressionError::Evaluation { .. })
        ));
        assert_eq!(
            evaluator.evaluate_condition("foo + 1", &vars(1.0)),
            Err(ExpressionError::NotBoolean("foo + 1".into()))
        );
    }

    #[test]
    fn resolves_paths_and_expressions() {
        let evaluator = EvalexprEvaluator::new();
        let mut variables = vars(2.0);
        variables.insert(
            "order".into(),
            Value::from(serde_json::json!({ "customer": { "id": 7 } })),
        );

        assert_eq!(
            evaluator.evaluate("orderId", &variables),
            Ok(Value::from("order-123"))
        );
        assert_eq!(
            evaluator.evaluate("order.customer.id", &variables),
            Ok(Value::Number(7.0))
        );
        assert_eq!(evaluator.evaluate("foo * 3", &variables), Ok(Value::Number(6.0)));
    }

    #[test]
    fn structured_variables_are_not_bound_for_expressions() {
        let evaluator = EvalexprEvaluator::new();
        let mut variables = vars(3.0);
        variables.insert("items".into(), Value::Array(vec![Value::Number(1.0)]));
        variables.insert("nothing".into(), Value::Null);

        assert_eq!(evaluator.evaluate_condition("foo > 2", &variables), Ok(true));
        assert!(matches!(
            evaluator.evaluate_condition("items == 1", &variables),
            Err(ExpressionError::Evaluation { .. })
        ));
        assert_eq!(
            evaluator.evaluate("items", &variables),
            Ok(Value::Array(vec![Value::Number(1.0)]))
        );
    }
}
