use std::collections::BTreeMap;

use anyhow::Result;
use pyhost::{BridgeError, ForeignKind, Value};
use serde::{Deserialize, Serialize};

use super::common::{acquire, acquire_with_fixtures};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i64,
    y: i64,
    label: Option<String>,
}

#[test]
fn integration_bridge_scalars_round_trip() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    let values = [
        Value::None,
        Value::Bool(true),
        Value::Int(i64::MIN),
        Value::Int(i64::MAX),
        Value::Float(2.5),
        Value::Str("héllo wörld".to_owned()),
        Value::Bytes(vec![0, 159, 255]),
    ];
    runtime.enter(|bridge| -> Result<()> {
        for value in values {
            let foreign = bridge.to_foreign(value.clone())?;
            assert_eq!(foreign.to_value()?, value);
        }
        assert_eq!(bridge.to_foreign(7_i32)?.kind(), ForeignKind::Int);
        assert_eq!(bridge.to_foreign(true)?.kind(), ForeignKind::Bool);
        assert_eq!(bridge.to_foreign(())?.kind(), ForeignKind::None);
        Ok(())
    })
}

#[test]
fn integration_bridge_containers_convert() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let value = bridge.eval("[1, (2, 'a'), {'k': None, 'f': 1.5}]", None)?.to_value()?;
        let expected = Value::List(vec![
            Value::Int(1),
            Value::Tuple(vec![Value::Int(2), Value::Str("a".to_owned())]),
            Value::Dict(BTreeMap::from([
                ("f".to_owned(), Value::Float(1.5)),
                ("k".to_owned(), Value::None),
            ])),
        ]);
        assert_eq!(value, expected);

        let list: Vec<i64> = bridge.eval("(3, 4, 5)", None)?.extract()?;
        assert_eq!(list, vec![3, 4, 5]);
        let maybe: Option<String> = bridge.eval("None", None)?.extract()?;
        assert_eq!(maybe, None);
        Ok(())
    })
}

#[test]
fn integration_bridge_out_of_range_numbers_fail() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let big = bridge.eval("2 ** 70", None)?;
        let err = big.extract::<i64>().expect_err("2**70 must not fit in i64");
        let BridgeError::ResultMarshal { value, .. } = &err else {
            panic!("expected result marshal error, got {err:?}");
        };
        assert!(value.contains("1180591620717411303424"), "unexpected value: {value}");
        assert!(big.to_value().is_err());
        assert_eq!(big.extract::<u128>()?, 1 << 70);

        assert!(bridge.eval("300", None)?.extract::<u8>().is_err());
        assert!(bridge.eval("-1", None)?.extract::<u32>().is_err());
        assert!(bridge.eval("1e300", None)?.extract::<f32>().is_err());
        assert!(bridge.eval("True", None)?.extract::<i64>().is_err());
        assert!(bridge.eval("'7'", None)?.extract::<i64>().is_err());
        assert_eq!(bridge.eval("7", None)?.extract::<f64>()?, 7.0);

        assert_eq!(bridge.eval("2 ** 53", None)?.extract::<f64>()?, 9_007_199_254_740_992.0);
        let err = bridge
            .eval("2 ** 53 + 1", None)?
            .extract::<f64>()
            .expect_err("2**53 + 1 has no exact f64");
        let BridgeError::ResultMarshal { reason, .. } = &err else {
            panic!("expected result marshal error, got {err:?}");
        };
        assert!(reason.contains("exactly"), "unexpected reason: {reason}");
        assert!(big.extract::<f64>().is_ok());
        assert!(bridge.eval("10 ** 400", None)?.extract::<f64>().is_err());
        Ok(())
    })
}

#[test]
fn integration_bridge_opaque_objects_do_not_convert() -> Result<()> {
    let Some((runtime, _dir)) = acquire_with_fixtures()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let module = bridge.load_module("example")?;
        let err = module.to_value().expect_err("a module is not a plain value");
        assert!(matches!(err, BridgeError::ResultMarshal { .. }), "{err:?}");

        let err = bridge
            .eval("{1: 'one'}", None)?
            .to_value()
            .expect_err("non-string keys are not representable");
        assert!(matches!(err, BridgeError::ResultMarshal { .. }), "{err:?}");

        let calc = module.attr("Calculator")?;
        assert_eq!(calc.kind(), ForeignKind::Class);
        assert_eq!(module.attr("add")?.kind(), ForeignKind::Callable);
        Ok(())
    })
}

#[test]
fn integration_bridge_cycles_are_bounded() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let scope = bridge.scope();
        bridge.exec("a = []\na.append(a)", &scope)?;
        let a = scope.get("a")?.expect("a is bound");
        let err = a.to_value().expect_err("cyclic list must not convert");
        assert!(err.to_string().contains("depth"), "unexpected error: {err}");

        let err = a
            .deserialize::<Vec<Value>>()
            .expect_err("cyclic list must not deserialize");
        assert!(err.to_string().contains("depth"), "unexpected error: {err}");
        Ok(())
    })
}

#[test]
fn integration_bridge_serde_types_cross() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    let point = Point {
        x: 3,
        y: -4,
        label: Some("origin-ish".to_owned()),
    };
    runtime.enter(|bridge| -> Result<()> {
        let foreign = bridge.serialize(&point)?;
        assert_eq!(foreign.kind(), ForeignKind::Dict);
        assert_eq!(foreign.call_method("get", pyhost::args!["y"]?)?.extract::<i64>()?, -4);
        assert_eq!(foreign.deserialize::<Point>()?, point);

        let scope = bridge.scope();
        bridge.exec("p = {'x': 1, 'y': 2, 'label': None}", &scope)?;
        let parsed: Point = scope.get("p")?.expect("p is bound").deserialize()?;
        assert_eq!(
            parsed,
            Point {
                x: 1,
                y: 2,
                label: None
            }
        );

        let err = bridge
            .eval("{'x': 'nope'}", None)?
            .deserialize::<Point>()
            .expect_err("wrong field type must fail");
        assert!(matches!(err, BridgeError::ResultMarshal { .. }), "{err:?}");
        Ok(())
    })
}
