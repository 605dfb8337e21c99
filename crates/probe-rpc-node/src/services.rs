//! Demo services exposed by `probe-rpc serve`.

use probe_rpc::{ServiceImpl, StaticContainer};
use serde_json::{json, Value};

fn string_arg(args: &[Value], index: usize) -> Result<&str, String> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("argument {} must be a string", index))
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, String> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("argument {} must be an integer", index))
}

/// `Greeter`: echo and greetings.
pub fn greeter() -> ServiceImpl {
    ServiceImpl::builder()
        .implements("Greeter")
        .method("echo", ["string"], |args| Ok(json!(string_arg(&args, 0)?)))
        .method("greet", ["string"], |args| {
            Ok(json!(format!("Hello, {}!", string_arg(&args, 0)?)))
        })
        .method("greet", ["string", "string"], |args| {
            Ok(json!(format!(
                "{}, {}!",
                string_arg(&args, 1)?,
                string_arg(&args, 0)?
            )))
        })
        .build()
}

/// `Calculator`: integer arithmetic.
pub fn calculator() -> ServiceImpl {
    ServiceImpl::builder()
        .implements("Calculator")
        .method("add", ["i64", "i64"], |args| {
            let sum = int_arg(&args, 0)?
                .checked_add(int_arg(&args, 1)?)
                .ok_or("overflow")?;
            Ok(json!(sum))
        })
        .method("divide", ["i64", "i64"], |args| {
            let divisor = int_arg(&args, 1)?;
            if divisor == 0 {
                return Err("division by zero".to_string());
            }
            let quotient = int_arg(&args, 0)?
                .checked_div(divisor)
                .ok_or("overflow")?;
            Ok(json!(quotient))
        })
        .build()
}

pub fn demo_container() -> StaticContainer {
    StaticContainer::new()
        .with("greeterImpl", greeter())
        .with("calculatorImpl", calculator())
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_rpc::ServiceDirectory;

    #[test]
    fn test_demo_directory() {
        let directory = ServiceDirectory::discover(&demo_container()).unwrap();
        assert_eq!(
            directory.interfaces().collect::<Vec<_>>(),
            vec!["Calculator", "Greeter"]
        );
    }

    #[test]
    fn test_greet_overloads() {
        let directory = ServiceDirectory::discover(&demo_container()).unwrap();

        let one = directory.lookup("Greeter", "greet", &[], 1).unwrap();
        assert_eq!(one(vec![json!("Ada")]).unwrap(), json!("Hello, Ada!"));

        let types = vec!["string".to_string(), "string".to_string()];
        let two = directory.lookup("Greeter", "greet", &types, 2).unwrap();
        assert_eq!(two(vec![json!("Ada"), json!("Hi")]).unwrap(), json!("Hi, Ada!"));
    }

    #[test]
    fn test_calculator_errors() {
        let directory = ServiceDirectory::discover(&demo_container()).unwrap();
        let divide = directory.lookup("Calculator", "divide", &[], 2).unwrap();
        assert_eq!(divide(vec![json!(9), json!(3)]).unwrap(), json!(3));
        assert_eq!(
            divide(vec![json!(1), json!(0)]).unwrap_err(),
            "division by zero"
        );
        assert!(divide(vec![json!("x"), json!(1)]).is_err());
        assert_eq!(
            divide(vec![json!(i64::MIN), json!(-1)]).unwrap_err(),
            "overflow"
        );
    }
}
