//! Numeric functions.

use super::{arg_int, arg_list, arg_number, arg_string, register, Function};
use crate::value::{Number, Value};
use std::collections::HashMap;

pub fn install(table: &mut HashMap<String, Function>) {
    register(table, "abs", 1, Some(1), |args| {
        Ok(match arg_number(args, 0)? {
            Number::Int(i) => Value::from(i.abs()),
            Number::Float(f) => Value::from(f.abs()),
        })
    });
    register(table, "ceil", 1, Some(1), |args| {
        Ok(Value::from(arg_number(args, 0)?.as_f64().ceil() as i64))
    });
    register(table, "floor", 1, Some(1), |args| {
        Ok(Value::from(arg_number(args, 0)?.as_f64().floor() as i64))
    });
    register(table, "signum", 1, Some(1), |args| {
        let n = arg_number(args, 0)?.as_f64();
        Ok(Value::from(if n > 0.0 {
            1i64
        } else if n < 0.0 {
            -1i64
        } else {
            0i64
        }))
    });
    register(table, "min", 1, None, |args| fold_extreme(args, true));
    register(table, "max", 1, None, |args| fold_extreme(args, false));
    register(table, "pow", 2, Some(2), |args| {
        let base = arg_number(args, 0)?.as_f64();
        let exp = arg_number(args, 1)?.as_f64();
        Ok(Value::Number(Number::from(base.powf(exp))))
    });
    register(table, "log", 2, Some(2), |args| {
        let x = arg_number(args, 0)?.as_f64();
        let base = arg_number(args, 1)?.as_f64();
        if x <= 0.0 || base <= 0.0 {
            return Err("log() requires positive operands".into());
        }
        Ok(Value::Number(Number::from(x.ln() / base.ln())))
    });
    register(table, "parseint", 2, Some(2), |args| {
        let s = arg_string(args, 0)?;
        let base = arg_int(args, 1)?;
        if !(2..=62).contains(&base) {
            return Err(format!("base must be between 2 and 62, got {}", base));
        }
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.as_str()),
        };
        let n = i64::from_str_radix(digits, base as u32)
            .map_err(|e| format!("cannot parse \"{}\" as base-{}: {}", s, base, e))?;
        Ok(Value::from(if negative { -n } else { n }))
    });
    register(table, "sum", 1, Some(1), |args| {
        let items = arg_list(args, 0)?;
        if items.is_empty() {
            return Err("sum() requires a non-empty list".into());
        }
        let mut int_total: i64 = 0;
        let mut float_total = 0.0;
        let mut float_mode = false;
        for item in &items {
            match item.coerce_number() {
                Some(Number::Int(i)) if !float_mode => match int_total.checked_add(i) {
                    Some(total) => int_total = total,
                    None => {
                        float_mode = true;
                        float_total = int_total as f64 + i as f64;
                    }
                },
                Some(n) => {
                    if !float_mode {
                        float_mode = true;
                        float_total = int_total as f64;
                    }
                    float_total += n.as_f64();
                }
                None => return Err(format!("sum() requires numbers, got {}", item.kind())),
            }
        }
        Ok(if float_mode {
            Value::Number(Number::from(float_total))
        } else {
            Value::from(int_total)
        })
    });
    register(table, "range", 1, Some(3), |args| {
        let (start, end, step) = match args.len() {
            1 => (0, arg_int(args, 0)?, 1),
            2 => (arg_int(args, 0)?, arg_int(args, 1)?, 1),
            _ => (arg_int(args, 0)?, arg_int(args, 1)?, arg_int(args, 2)?),
        };
        if step == 0 {
            return Err("range() step must not be zero".into());
        }
        let mut out = Vec::new();
        let mut current = start;
        while (step > 0 && current < end) || (step < 0 && current > end) {
            out.push(Value::from(current));
            current += step;
        }
        Ok(Value::List(out))
    });
}

fn fold_extreme(args: &[Value], want_min: bool) -> Result<Value, String> {
    // min(1, 2) or min([1, 2]) via expansion both arrive as plain numbers.
    let mut best: Option<Number> = None;
    for (i, _) in args.iter().enumerate() {
        let n = arg_number(args, i)?;
        best = Some(match best {
            None => n,
            Some(b) => {
                let replace = if want_min { n < b } else { n > b };
                if replace {
                    n
                } else {
                    b
                }
            }
        });
    }
    Ok(Value::Number(best.expect("arity enforces one argument")))
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
    use std::path::PathBuf;

    fn call(name: &str, args: &[Value]) -> Result<Value, String> {
        let table = super::super::standard_functions(PathBuf::from("/"));
        table
            .get(name)
            .unwrap()
            .call(name, args)
            .map_err(|d| d.to_string())
    }

    #[test]
    fn test_min_max() {
        assert_eq!(
            call("min", &[Value::from(3), Value::from(1), Value::from(2)]).unwrap(),
            Value::from(1)
        );
        assert_eq!(
            call("max", &[Value::from(3), Value::from(1)]).unwrap(),
            Value::from(3)
        );
    }

    #[test]
    fn test_parseint() {
        assert_eq!(
            call("parseint", &["ff".into(), Value::from(16)]).unwrap(),
            Value::from(255)
        );
        assert_eq!(
            call("parseint", &["-10".into(), Value::from(2)]).unwrap(),
            Value::from(-2)
        );
        assert!(call("parseint", &["zz".into(), Value::from(10)]).is_err());
    }

    #[test]
    fn test_range() {
        assert_eq!(
            call("range", &[Value::from(3)]).unwrap(),
            Value::List(vec![Value::from(0), Value::from(1), Value::from(2)])
        );
        assert_eq!(
            call("range", &[Value::from(1), Value::from(7), Value::from(3)]).unwrap(),
            Value::List(vec![Value::from(1), Value::from(4)])
        );
        assert_eq!(
            call("range", &[Value::from(3), Value::from(0), Value::from(-1)]).unwrap(),
            Value::List(vec![Value::from(3), Value::from(2), Value::from(1)])
        );
    }

    #[test]
    fn test_sum_stays_integral() {
        let items = Value::List(vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(call("sum", &[items]).unwrap(), Value::from(6));
        let mixed = Value::List(vec![Value::from(1), Value::from(0.5)]);
        assert_eq!(call("sum", &[mixed]).unwrap(), Value::from(1.5));
    }

    #[test]
    fn test_ceil_floor_signum() {
        assert_eq!(call("ceil", &[Value::from(1.1)]).unwrap(), Value::from(2));
        assert_eq!(call("floor", &[Value::from(1.9)]).unwrap(), Value::from(1));
        assert_eq!(call("signum", &[Value::from(-9)]).unwrap(), Value::from(-1));
    }
}
