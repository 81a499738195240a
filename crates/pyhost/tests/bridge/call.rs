use anyhow::{Context, Result};
use pyhost::{Args, BridgeError, args};
use pyo3::types::PyDictMethods;

use super::common::{acquire, acquire_with_fixtures};

#[test]
fn integration_bridge_call_module_functions() -> Result<()> {
    let Some((runtime, _dir)) = acquire_with_fixtures()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let example = bridge.load_module("example").context("failed to load example")?;

        let sum: i64 = example.attr("add")?.call(args![5, 3]?)?.extract()?;
        assert_eq!(sum, 8);

        let greeting: String = example.attr("greet")?.call(args!["World"]?)?.extract()?;
        assert_eq!(greeting, "Hello, World!");

        let squares: Vec<i64> = example
            .attr("square_list")?
            .call(args![vec![1, 2, 3, 4]]?)?
            .extract()?;
        assert_eq!(squares, vec![1, 4, 9, 16]);

        let concatenated: String = example
            .attr("add")?
            .call(args!["py", "host"]?)?
            .extract()?;
        assert_eq!(concatenated, "pyhost");
        Ok(())
    })
}

#[test]
fn integration_bridge_class_instances_keep_state() -> Result<()> {
    let Some((runtime, _dir)) = acquire_with_fixtures()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let example = bridge.load_module("example")?;
        let calc = example.attr("Calculator")?.call(args![10.0]?)?;

        let value: f64 = calc.call_method("get_value", Args::new())?.extract()?;
        assert!((value - 10.0).abs() < f64::EPSILON);

        let added: f64 = calc.call_method("add", args![5.0]?)?.extract()?;
        assert!((added - 15.0).abs() < f64::EPSILON);
        let value: f64 = calc.call_method("get_value", Args::new())?.extract()?;
        assert!((value - 15.0).abs() < f64::EPSILON);

        let seen: f64 = example
            .attr("value_of")?
            .call(args![@foreign(&calc)]?)?
            .extract()?;
        assert!((seen - 15.0).abs() < f64::EPSILON);

        calc.call_method("reset", Args::new())?;
        let value: f64 = calc.attr("value")?.extract()?;
        assert!(value.abs() < f64::EPSILON);
        Ok(())
    })
}

#[test]
fn integration_bridge_keyword_arguments() -> Result<()> {
    let Some((runtime, _dir)) = acquire_with_fixtures()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let describe = bridge.load_module("example")?.attr("describe")?;

        let value: i64 = describe.call(args![2, b = 3, scale = 10]?)?.extract()?;
        assert_eq!(value, 50);
        let value: i64 = describe
            .call(Args::new().arg(2).kwarg("scale", 4))?
            .extract()?;
        assert_eq!(value, 8);

        let err = describe
            .call(Args::new().arg(1).kwarg("not valid", 2))
            .expect_err("expected invalid keyword to be rejected");
        let BridgeError::ArgumentMarshal { reason, .. } = &err else {
            panic!("expected argument marshal error, got {err:?}");
        };
        assert!(reason.contains("identifier"), "unexpected error message: {reason}");

        let err = describe
            .call(Args::new().arg(1).kwarg("b", 2).kwarg("b", 3))
            .expect_err("expected duplicate keyword to be rejected");
        assert!(matches!(err, BridgeError::ArgumentMarshal { .. }), "{err:?}");

        let err = describe
            .call(Args::new().arg(1).kwarg("unknown", 2))
            .expect_err("expected unexpected keyword to raise");
        let BridgeError::ForeignException { kind, .. } = &err else {
            panic!("expected foreign exception, got {err:?}");
        };
        assert_eq!(kind, "TypeError");
        Ok(())
    })
}

#[test]
fn integration_bridge_attributes() -> Result<()> {
    let Some((runtime, _dir)) = acquire_with_fixtures()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let example = bridge.load_module("example")?;
        assert!(example.has_attr("greet"));
        assert!(!example.has_attr("missing_function"));

        let err = example
            .attr("missing_function")
            .expect_err("expected missing attribute");
        let BridgeError::AttributeNotFound { name, .. } = &err else {
            panic!("expected attribute not found, got {err:?}");
        };
        assert_eq!(name, "missing_function");
        assert!(err.is_recoverable());

        example.set_attr("injected", vec![1, 2])?;
        let injected: Vec<i64> = example.attr("injected")?.extract()?;
        assert_eq!(injected, vec![1, 2]);

        let err = example
            .call(Args::new())
            .expect_err("a module is not callable");
        assert!(matches!(err, BridgeError::ForeignException { .. }), "{err:?}");
        Ok(())
    })
}

#[test]
fn integration_bridge_attribute_errors_inside_getters() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let scope = bridge.scope();
        bridge.exec(
            "
            class Order:
                @property
                def total(self):
                    return self.missing_field + 1

                @property
                def discount(self):
                    raise AttributeError('discount is not priced yet')

                def __getattr__(self, name):
                    if name == 'currency':
                        return 'EUR'
                    raise AttributeError(name)

            order = Order()
            ",
            &scope,
        )?;
        let order = scope.get("order")?.context("order is bound")?;

        let err = order.attr("total").expect_err("expected getter to raise");
        let BridgeError::ForeignException { kind, message, .. } = &err else {
            panic!("expected foreign exception, got {err:?}");
        };
        assert_eq!(kind, "AttributeError");
        assert!(message.contains("missing_field"), "unexpected error message: {message}");

        let err = order.attr("discount").expect_err("expected getter to raise");
        let BridgeError::ForeignException { message, .. } = &err else {
            panic!("expected foreign exception, got {err:?}");
        };
        assert!(message.contains("not priced"), "unexpected error message: {message}");

        assert_eq!(order.attr("currency")?.extract::<String>()?, "EUR");
        let err = order.attr("weight").expect_err("expected missing attribute");
        let BridgeError::AttributeNotFound { name, .. } = &err else {
            panic!("expected attribute not found, got {err:?}");
        };
        assert_eq!(name, "weight");
        Ok(())
    })
}

#[test]
fn integration_bridge_scopes() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    runtime.enter(|bridge| -> Result<()> {
        let scope = bridge.scope_with_locals();
        scope.set("x", 21)?;
        bridge.exec(
            "
            y = x * 2
            def helper():
                return 'unused'
            ",
            &scope,
        )?;
        let y = scope.local("y")?.context("y should be a local")?;
        assert_eq!(y.extract::<i64>()?, 42);
        assert!(scope.globals().get_item("y")?.is_none());
        assert_eq!(scope.get("x")?.context("x is bound")?.extract::<i64>()?, 21);

        let total: i64 = bridge.eval("x + y", Some(&scope))?.extract()?;
        assert_eq!(total, 63);

        let shared = bridge.scope();
        shared.set("items", vec!["a", "b"])?;
        bridge.exec("joined = '-'.join(items)", &shared)?;
        let joined: String = shared.get("joined")?.context("joined is bound")?.extract()?;
        assert_eq!(joined, "a-b");
        Ok(())
    })
}
