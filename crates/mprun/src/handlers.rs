//! Methods served by `mprun serve`.

use mprpc::Dispatcher;
use mprpc::Params;
use mpwire::Failure;
use mpwire::Value;

pub fn arithmetic() -> Dispatcher {
    let dispatcher = Dispatcher::new();
    dispatcher.add_fn("add", |p: Params| binary(&p, i64::checked_add, |a, b| a + b));
    dispatcher.add_fn("mul", |p: Params| binary(&p, i64::checked_mul, |a, b| a * b));
    dispatcher.add_fn("echo", |p: Params| Ok(Value::Array(p.into_vec())));
    dispatcher
}

/// Integer arithmetic when both operands are integers and the result fits,
/// float arithmetic otherwise.
fn binary(
    p: &Params,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value, Failure> {
    p.expect_len(2)?;
    if let (Ok(a), Ok(b)) = (p.i64(0), p.i64(1)) {
        if let Some(n) = int(a, b) {
            return Ok(Value::from(n));
        }
    }
    Ok(Value::from(float(p.f64(0)?, p.f64(1)?)))
}
