//! Collection functions.

use super::{arg_entries, arg_int, arg_list, arg_string, register, string_items, Function};
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;

pub fn install(table: &mut HashMap<String, Function>) {
    register(table, "length", 1, Some(1), |args| {
        args[0]
            .length()
            .map(|n| Value::from(n as i64))
            .ok_or_else(|| format!("cannot take the length of a {} value", args[0].kind()))
    });
    register(table, "concat", 1, None, |args| {
        let mut out = Vec::new();
        for (i, _) in args.iter().enumerate() {
            out.extend(arg_list(args, i)?);
        }
        Ok(Value::List(out))
    });
    register(table, "distinct", 1, Some(1), |args| {
        let mut out: Vec<Value> = Vec::new();
        for item in arg_list(args, 0)? {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Ok(Value::List(out))
    });
    register(table, "flatten", 1, Some(1), |args| {
        fn flatten_into(items: Vec<Value>, out: &mut Vec<Value>) {
            for item in items {
                match item {
                    Value::List(inner) | Value::Set(inner) => flatten_into(inner, out),
                    other => out.push(other),
                }
            }
        }
        let mut out = Vec::new();
        flatten_into(arg_list(args, 0)?, &mut out);
        Ok(Value::List(out))
    });
    register(table, "keys", 1, Some(1), |args| {
        Ok(Value::List(
            arg_entries(args, 0)?.keys().map(|k| Value::from(k.as_str())).collect(),
        ))
    });
    register(table, "values", 1, Some(1), |args| {
        Ok(Value::List(arg_entries(args, 0)?.into_values().collect()))
    });
    register(table, "lookup", 2, Some(3), |args| {
        let entries = arg_entries(args, 0)?;
        let key = arg_string(args, 1)?;
        match entries.get(&key) {
            Some(v) => Ok(v.clone()),
            None => args
                .get(2)
                .cloned()
                .ok_or_else(|| format!("the map has no key \"{}\" and no default was given", key)),
        }
    });
    register(table, "merge", 1, None, |args| {
        let mut out: IndexMap<String, Value> = IndexMap::new();
        for (i, _) in args.iter().enumerate() {
            if args[i].is_null() {
                continue;
            }
            out.extend(arg_entries(args, i)?);
        }
        Ok(Value::Object(out))
    });
    register(table, "element", 2, Some(2), |args| {
        let items = arg_list(args, 0)?;
        if items.is_empty() {
            return Err("cannot use element() with an empty list".into());
        }
        let idx = arg_int(args, 1)?.rem_euclid(items.len() as i64) as usize;
        Ok(items[idx].clone())
    });
    register(table, "index", 2, Some(2), |args| {
        let items = arg_list(args, 0)?;
        items
            .iter()
            .position(|v| *v == args[1])
            .map(|i| Value::from(i as i64))
            .ok_or_else(|| "the given value is not in the list".to_string())
    });
    register(table, "contains", 2, Some(2), |args| {
        Ok(Value::Bool(arg_list(args, 0)?.contains(&args[1])))
    });
    register(table, "slice", 3, Some(3), |args| {
        let items = arg_list(args, 0)?;
        let start = arg_int(args, 1)?;
        let end = arg_int(args, 2)?;
        if start < 0 || end < start || end as usize > items.len() {
            return Err(format!(
                "invalid slice range {}..{} for a list of {} element(s)",
                start,
                end,
                items.len()
            ));
        }
        Ok(Value::List(items[start as usize..end as usize].to_vec()))
    });
    register(table, "sort", 1, Some(1), |args| {
        let mut items = string_items(&arg_list(args, 0)?, "sort() list")?;
        items.sort();
        Ok(Value::List(items.into_iter().map(Value::from).collect()))
    });
    register(table, "reverse", 1, Some(1), |args| {
        let mut items = arg_list(args, 0)?;
        items.reverse();
        Ok(Value::List(items))
    });
    register(table, "compact", 1, Some(1), |args| {
        let items = string_items(&arg_list(args, 0)?, "compact() list")?;
        Ok(Value::List(
            items
                .into_iter()
                .filter(|s| !s.is_empty())
                .map(Value::from)
                .collect(),
        ))
    });
    register(table, "chunklist", 2, Some(2), |args| {
        let items = arg_list(args, 0)?;
        let size = arg_int(args, 1)?;
        if size <= 0 {
            return Err("chunk size must be positive".into());
        }
        Ok(Value::List(
            items
                .chunks(size as usize)
                .map(|chunk| Value::List(chunk.to_vec()))
                .collect(),
        ))
    });
    register(table, "setunion", 1, None, |args| {
        let mut out = Vec::new();
        for (i, _) in args.iter().enumerate() {
            for item in arg_list(args, i)? {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
        }
        Ok(Value::Set(out))
    });
    register(table, "setintersection", 1, None, |args| {
        let mut out = arg_list(args, 0)?;
        for (i, _) in args.iter().enumerate().skip(1) {
            let other = arg_list(args, i)?;
            out.retain(|v| other.contains(v));
        }
        Ok(Value::set_of(out))
    });
    register(table, "setsubtract", 2, Some(2), |args| {
        let mut out = arg_list(args, 0)?;
        let remove = arg_list(args, 1)?;
        out.retain(|v| !remove.contains(v));
        Ok(Value::set_of(out))
    });
    register(table, "setproduct", 2, None, |args| {
        let mut product: Vec<Vec<Value>> = vec![Vec::new()];
        for (i, _) in args.iter().enumerate() {
            let items = arg_list(args, i)?;
            let mut next = Vec::with_capacity(product.len() * items.len());
            for row in &product {
                for item in &items {
                    let mut extended = row.clone();
                    extended.push(item.clone());
                    next.push(extended);
                }
            }
            product = next;
        }
        Ok(Value::List(product.into_iter().map(Value::List).collect()))
    });
    register(table, "zipmap", 2, Some(2), |args| {
        let keys = string_items(&arg_list(args, 0)?, "zipmap() keys")?;
        let values = arg_list(args, 1)?;
        if keys.len() != values.len() {
            return Err(format!(
                "zipmap() key and value lists must have the same length ({} vs {})",
                keys.len(),
                values.len()
            ));
        }
        Ok(Value::Map(keys.into_iter().zip(values).collect()))
    });
    register(table, "transpose", 1, Some(1), |args| {
        let entries = arg_entries(args, 0)?;
        let mut out: IndexMap<String, Value> = IndexMap::new();
        for (key, value) in entries {
            let items = value
                .as_slice()
                .ok_or_else(|| "transpose() requires a map of lists of strings".to_string())?;
            for item in string_items(items, "transpose() values")? {
                match out
                    .entry(item)
                    .or_insert_with(|| Value::List(Vec::new()))
                {
                    Value::List(list) => list.push(Value::from(key.as_str())),
                    _ => unreachable!(),
                }
            }
        }
        Ok(Value::Map(out))
    });
    register(table, "matchkeys", 3, Some(3), |args| {
        let values = arg_list(args, 0)?;
        let keys = arg_list(args, 1)?;
        let searchset = arg_list(args, 2)?;
        if values.len() != keys.len() {
            return Err("matchkeys() value and key lists must have the same length".into());
        }
        Ok(Value::List(
            values
                .into_iter()
                .zip(keys)
                .filter(|(_, k)| searchset.contains(k))
                .map(|(v, _)| v)
                .collect(),
        ))
    });
    register(table, "one", 1, Some(1), |args| {
        let items = arg_list(args, 0)?;
        match items.len() {
            0 => Ok(Value::NULL),
            1 => Ok(items.into_iter().next().expect("length checked")),
            n => Err(format!("one() requires a list of zero or one element, got {}", n)),
        }
    });
    register(table, "coalesce", 1, None, |args| {
        for arg in args {
            if arg.is_null() {
                continue;
            }
            if arg.as_str().is_some_and(str::is_empty) {
                continue;
            }
            return Ok(arg.clone());
        }
        Err("no non-null, non-empty-string arguments".into())
    });
    register(table, "coalescelist", 1, None, |args| {
        for (i, arg) in args.iter().enumerate() {
            if arg.is_null() {
                continue;
            }
            let items = arg_list(args, i)?;
            if !items.is_empty() {
                return Ok(Value::List(items));
            }
        }
        Err("no non-empty list arguments".into())
    });
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

    fn list(items: &[i64]) -> Value {
        Value::List(items.iter().map(|i| Value::from(*i)).collect())
    }

    #[test]
    fn test_concat_flatten_distinct() {
        assert_eq!(
            call("concat", &[list(&[1]), list(&[2, 3])]).unwrap(),
            list(&[1, 2, 3])
        );
        let nested = Value::List(vec![list(&[1, 2]), list(&[3])]);
        assert_eq!(call("flatten", &[nested]).unwrap(), list(&[1, 2, 3]));
        assert_eq!(call("distinct", &[list(&[1, 2, 1])]).unwrap(), list(&[1, 2]));
    }

    #[test]
    fn test_element_wraps() {
        assert_eq!(call("element", &[list(&[1, 2, 3]), Value::from(4)]).unwrap(), Value::from(2));
    }

    #[test]
    fn test_lookup_with_default() {
        let map = Value::object_of(vec![("a".to_string(), Value::from(1))]);
        assert_eq!(
            call("lookup", &[map.clone(), "a".into()]).unwrap(),
            Value::from(1)
        );
        assert_eq!(
            call("lookup", &[map.clone(), "b".into(), Value::from(9)]).unwrap(),
            Value::from(9)
        );
        assert!(call("lookup", &[map, "b".into()]).is_err());
    }

    #[test]
    fn test_set_operations() {
        let a = list(&[1, 2, 3]);
        let b = list(&[2, 3, 4]);
        assert_eq!(
            call("setintersection", &[a.clone(), b.clone()]).unwrap(),
            Value::Set(vec![Value::from(2), Value::from(3)])
        );
        assert_eq!(
            call("setsubtract", &[a.clone(), b.clone()]).unwrap(),
            Value::Set(vec![Value::from(1)])
        );
        let union = call("setunion", &[a, b]).unwrap();
        assert_eq!(union.as_slice().unwrap().len(), 4);
    }

    #[test]
    fn test_zipmap_transpose() {
        let keys = Value::List(vec!["a".into(), "b".into()]);
        let values = list(&[1, 2]);
        let zipped = call("zipmap", &[keys, values]).unwrap();
        assert_eq!(zipped.as_entries().unwrap()["b"], Value::from(2));

        let m = Value::object_of(vec![(
            "a".to_string(),
            Value::List(vec!["x".into(), "y".into()]),
        )]);
        let t = call("transpose", &[m]).unwrap();
        assert_eq!(
            t.as_entries().unwrap()["x"],
            Value::List(vec!["a".into()])
        );
    }

    #[test]
    fn test_coalesce() {
        assert_eq!(
            call("coalesce", &[Value::NULL, "".into(), "x".into()]).unwrap(),
            Value::from("x")
        );
        assert!(call("coalesce", &[Value::NULL]).is_err());
    }

    #[test]
    fn test_one() {
        assert_eq!(call("one", &[list(&[])]).unwrap(), Value::NULL);
        assert_eq!(call("one", &[list(&[7])]).unwrap(), Value::from(7));
        assert!(call("one", &[list(&[1, 2])]).is_err());
    }

    #[test]
    fn test_setproduct() {
        let got = call("setproduct", &[list(&[1, 2]), list(&[3])]).unwrap();
        assert_eq!(
            got,
            Value::List(vec![
                Value::List(vec![Value::from(1), Value::from(3)]),
                Value::List(vec![Value::from(2), Value::from(3)]),
            ])
        );
    }
}
