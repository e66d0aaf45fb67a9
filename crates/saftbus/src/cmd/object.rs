//! Generic object access: introspection, properties and method calls.

use std::collections::BTreeMap;

use saftbus_core::{MethodCall, ProxyConnection, INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE};
use saftbus_serial::{FromValue, Signature, Value};

use crate::cmd::{CallArgs, GetArgs, Globals, SetArgs, TargetArgs};
use crate::exit::{bus_error, usage_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_properties, print_values, OutputFormat};

fn invoke(connection: &ProxyConnection, call: MethodCall, what: &str) -> CliResult<Vec<Value>> {
    connection
        .call_sync(&call)
        .map_err(|err| bus_error(&format!("{what} failed"), err))
}

pub fn introspect(args: TargetArgs, globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    let call = MethodCall::new(args.path.as_str(), INTROSPECTABLE_INTERFACE, "Introspect", Vec::new());
    let reply = invoke(&connection, call, "introspect")?;
    // The XML is only useful verbatim, whatever the format.
    match (globals.format, reply.first()) {
        (OutputFormat::Json, _) => print_values(&reply, OutputFormat::Json),
        (_, Some(Value::Str(xml))) => println!("{xml}"),
        _ => print_values(&reply, globals.format),
    }
    Ok(SUCCESS)
}

pub fn get(args: GetArgs, globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    let call = MethodCall::new(
        args.path.as_str(),
        PROPERTIES_INTERFACE,
        "Get",
        vec![Value::Str(args.interface), Value::Str(args.property)],
    );
    let reply = invoke(&connection, call, "get")?;
    print_values(&reply, globals.format);
    Ok(SUCCESS)
}

pub fn get_all(args: TargetArgs, globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    let call = MethodCall::new(
        args.path.as_str(),
        PROPERTIES_INTERFACE,
        "GetAll",
        vec![Value::Str(args.interface)],
    );
    let mut reply = invoke(&connection, call, "get-all")?;
    let properties = match reply.pop() {
        Some(value) if reply.is_empty() => BTreeMap::<String, Value>::from_value(value)
            .map_err(|err| CliError::new(DATA_INVALID, format!("get-all reply: {err}")))?,
        _ => return Err(CliError::new(DATA_INVALID, "get-all reply: expected one property map")),
    };
    print_properties(&properties, globals.format);
    Ok(SUCCESS)
}

pub fn set(args: SetArgs, globals: &Globals) -> CliResult<i32> {
    let value = parse_typed(&args.signature, &args.literal)?;
    let (_context, connection) = globals.connect()?;
    let call = MethodCall::new(
        args.path.as_str(),
        PROPERTIES_INTERFACE,
        "Set",
        vec![Value::Str(args.interface), Value::Str(args.property), value],
    );
    invoke(&connection, call, "set")?;
    Ok(SUCCESS)
}

pub fn call(args: CallArgs, globals: &Globals) -> CliResult<i32> {
    let values = parse_pairs(&args.args)?;
    let (_context, connection) = globals.connect()?;
    let call = MethodCall::new(args.path.as_str(), args.interface.as_str(), args.method.as_str(), values);
    let reply = invoke(&connection, call, "call")?;
    print_values(&reply, globals.format);
    Ok(SUCCESS)
}

fn parse_typed(signature: &str, literal: &str) -> CliResult<Value> {
    let signature = Signature::parse(signature).map_err(|err| usage_error("bad signature", err))?;
    signature
        .parse_literal(literal)
        .map_err(|err| usage_error("bad literal", err))
}

/// Turn `<sig> <literal>` pairs into call arguments.
fn parse_pairs(args: &[String]) -> CliResult<Vec<Value>> {
    if args.len() % 2 != 0 {
        return Err(CliError::new(
            USAGE,
            "method arguments come in <SIG> <LITERAL> pairs",
        ));
    }
    args.chunks(2)
        .map(|pair| parse_typed(&pair[0], &pair[1]))
        .collect()
}
