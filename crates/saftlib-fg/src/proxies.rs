//! Typed client-side proxies for the function-generator objects.

use std::collections::BTreeMap;

use saftbus_core::{ClientContext, Proxy, SignalRoute};
use saftbus_serial::{ArgReader, FromValue, Value};
use tracing::warn;

use crate::backend::ParameterSet;
use crate::channel::FG_INTERFACE;
use crate::error::Result;
use crate::master::MASTER_FG_INTERFACE;
use crate::saftd::{SAFTD_INTERFACE, SAFTD_PATH};

/// Payload of a `Stopped` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent {
    pub time: u64,
    pub abort: bool,
    pub hardware_underflow: bool,
    pub microcontroller_underflow: bool,
}

fn read_stop(args: &mut ArgReader<'_>) -> saftbus_serial::Result<StopEvent> {
    Ok(StopEvent {
        time: args.next()?,
        abort: args.next()?,
        hardware_underflow: args.next()?,
        microcontroller_underflow: args.next()?,
    })
}

fn parse_named_stop(params: &[Value]) -> saftbus_serial::Result<(String, StopEvent)> {
    let mut args = ArgReader::new(params);
    let name = args.next()?;
    let stop = read_stop(&mut args)?;
    args.finish()?;
    Ok((name, stop))
}

/// Connect `handler` to a signal carrying a single `T`.
fn on_single<T: FromValue>(proxy: &Proxy, name: &'static str, handler: impl Fn(T) + 'static) {
    proxy.connect_signal(name, move |params| {
        let mut args = ArgReader::new(params);
        match args.next::<T>().and_then(|value| args.finish().map(|()| value)) {
            Ok(value) => handler(value),
            Err(err) => warn!(signal = name, error = %err, "malformed signal dropped"),
        }
    });
}

fn bytes(column: &[u8]) -> Value {
    Value::Bytes(column.to_vec())
}

fn int16s(column: &[i16]) -> Value {
    Value::Seq(column.iter().copied().map(Value::Int16).collect())
}

fn int32s(column: &[i32]) -> Value {
    Value::Seq(column.iter().copied().map(Value::Int32).collect())
}

/// One argument column of `AppendParameterSets`, one entry per channel.
fn column(sets: &[ParameterSet], field: impl Fn(&ParameterSet) -> Value) -> Value {
    Value::Seq(sets.iter().map(field).collect())
}

#[derive(Debug)]
pub struct FunctionGeneratorProxy {
    proxy: Proxy,
}

impl FunctionGeneratorProxy {
    pub fn new(context: &ClientContext, path: impl Into<String>) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::new(context, path, FG_INTERFACE)?,
        })
    }

    pub fn with_route(context: &ClientContext, path: impl Into<String>, route: SignalRoute) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::with_route(context, path, FG_INTERFACE, route)?,
        })
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Returns true while the channel wants more data.
    pub fn append_parameter_set(&self, set: &ParameterSet) -> Result<bool> {
        let args = vec![
            int16s(&set.coeff_a),
            int16s(&set.coeff_b),
            int32s(&set.coeff_c),
            bytes(&set.step),
            bytes(&set.freq),
            bytes(&set.shift_a),
            bytes(&set.shift_b),
        ];
        Ok(self.proxy.call_returning("AppendParameterSet", args)?)
    }

    pub fn flush(&self) -> Result<()> {
        self.proxy.call("Flush", Vec::new())?;
        Ok(())
    }

    pub fn arm(&self) -> Result<()> {
        self.proxy.call("Arm", Vec::new())?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.proxy.call("Reset", Vec::new())?;
        Ok(())
    }

    pub fn own(&self) -> Result<()> {
        Ok(self.proxy.own()?)
    }

    pub fn disown(&self) -> Result<()> {
        Ok(self.proxy.disown()?)
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.proxy.get_as("Name")?)
    }

    pub fn armed(&self) -> Result<bool> {
        Ok(self.proxy.get_as("Armed")?)
    }

    pub fn enabled(&self) -> Result<bool> {
        Ok(self.proxy.get_as("Enabled")?)
    }

    pub fn running(&self) -> Result<bool> {
        Ok(self.proxy.get_as("Running")?)
    }

    pub fn fill_level(&self) -> Result<u64> {
        Ok(self.proxy.get_as("FillLevel")?)
    }

    pub fn start_tag(&self) -> Result<u32> {
        Ok(self.proxy.get_as("StartTag")?)
    }

    pub fn executed_parameter_count(&self) -> Result<u32> {
        Ok(self.proxy.get_as("ExecutedParameterCount")?)
    }

    pub fn on_armed(&self, handler: impl Fn(bool) + 'static) {
        on_single(&self.proxy, "Armed", handler);
    }

    pub fn on_enabled(&self, handler: impl Fn(bool) + 'static) {
        on_single(&self.proxy, "Enabled", handler);
    }

    pub fn on_running(&self, handler: impl Fn(bool) + 'static) {
        on_single(&self.proxy, "Running", handler);
    }

    pub fn on_started(&self, handler: impl Fn(u64) + 'static) {
        on_single(&self.proxy, "Started", handler);
    }

    pub fn on_stopped(&self, handler: impl Fn(StopEvent) + 'static) {
        self.proxy.connect_signal("Stopped", move |params| {
            let mut args = ArgReader::new(params);
            match read_stop(&mut args).and_then(|stop| args.finish().map(|()| stop)) {
                Ok(stop) => handler(stop),
                Err(err) => warn!(error = %err, "malformed Stopped signal dropped"),
            }
        });
    }
}

#[derive(Debug)]
pub struct MasterFunctionGeneratorProxy {
    proxy: Proxy,
}

impl MasterFunctionGeneratorProxy {
    pub fn new(context: &ClientContext, path: impl Into<String>) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::new(context, path, MASTER_FG_INTERFACE)?,
        })
    }

    pub fn with_route(context: &ClientContext, path: impl Into<String>, route: SignalRoute) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::with_route(context, path, MASTER_FG_INTERFACE, route)?,
        })
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Load one dataset per channel. With `wait_for_arm_ack` the call
    /// returns only once every loaded channel is armed.
    pub fn append_parameter_sets(&self, sets: &[ParameterSet], arm: bool, wait_for_arm_ack: bool) -> Result<bool> {
        let args = vec![
            column(sets, |s| int16s(&s.coeff_a)),
            column(sets, |s| int16s(&s.coeff_b)),
            column(sets, |s| int32s(&s.coeff_c)),
            column(sets, |s| bytes(&s.step)),
            column(sets, |s| bytes(&s.freq)),
            column(sets, |s| bytes(&s.shift_a)),
            column(sets, |s| bytes(&s.shift_b)),
            Value::Bool(arm),
            Value::Bool(wait_for_arm_ack),
        ];
        Ok(self.proxy.call_returning("AppendParameterSets", args)?)
    }

    pub fn arm(&self) -> Result<()> {
        self.proxy.call("Arm", Vec::new())?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.proxy.call("Reset", Vec::new())?;
        Ok(())
    }

    /// Returns once no channel is running any more.
    pub fn abort(&self) -> Result<()> {
        self.proxy.call("Abort", Vec::new())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.proxy.call("Flush", Vec::new())?;
        Ok(())
    }

    pub fn own(&self) -> Result<()> {
        Ok(self.proxy.own()?)
    }

    pub fn disown(&self) -> Result<()> {
        Ok(self.proxy.disown()?)
    }

    pub fn start_tag(&self) -> Result<u32> {
        Ok(self.proxy.get_as("StartTag")?)
    }

    pub fn set_start_tag(&self, tag: u32) -> Result<()> {
        Ok(self.proxy.set("StartTag", Value::UInt32(tag))?)
    }

    pub fn generate_individual_stop_signals(&self) -> Result<bool> {
        Ok(self.proxy.get_as("GenerateIndividualStopSignals")?)
    }

    pub fn set_generate_individual_stop_signals(&self, on: bool) -> Result<()> {
        Ok(self.proxy.set("GenerateIndividualStopSignals", Value::Bool(on))?)
    }

    pub fn read_fill_levels(&self) -> Result<Vec<u64>> {
        Ok(self.proxy.call_returning("ReadFillLevels", Vec::new())?)
    }

    pub fn read_names(&self) -> Result<Vec<String>> {
        Ok(self.proxy.call_returning("ReadNames", Vec::new())?)
    }

    pub fn read_armed(&self) -> Result<Vec<bool>> {
        Ok(self.proxy.call_returning("ReadArmed", Vec::new())?)
    }

    pub fn read_enabled(&self) -> Result<Vec<bool>> {
        Ok(self.proxy.call_returning("ReadEnabled", Vec::new())?)
    }

    pub fn read_executed_parameter_counts(&self) -> Result<Vec<u32>> {
        Ok(self.proxy.call_returning("ReadExecutedParameterCounts", Vec::new())?)
    }

    pub fn on_all_armed(&self, handler: impl Fn() + 'static) {
        self.proxy.connect_signal("AllArmed", move |_| handler());
    }

    pub fn on_all_stopped(&self, handler: impl Fn(u64) + 'static) {
        on_single(&self.proxy, "AllStopped", handler);
    }

    pub fn on_start_tag(&self, handler: impl Fn(u32) + 'static) {
        on_single(&self.proxy, "StartTag", handler);
    }

    /// Per-channel stops; delivered only while individual stop signals are on.
    pub fn on_stopped(&self, handler: impl Fn(&str, StopEvent) + 'static) {
        self.proxy.connect_signal("Stopped", move |params| {
            let parsed = parse_named_stop(params);
            match parsed {
                Ok((name, stop)) => handler(&name, stop),
                Err(err) => warn!(error = %err, "malformed Stopped signal dropped"),
            }
        });
    }
}

#[derive(Debug)]
pub struct SaftdProxy {
    proxy: Proxy,
}

impl SaftdProxy {
    pub fn new(context: &ClientContext) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::new(context, SAFTD_PATH, SAFTD_INTERFACE)?,
        })
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Returns the object path of the new device.
    pub fn attach_device(&self, name: &str, device: &str) -> Result<String> {
        let args = vec![Value::Str(name.to_string()), Value::Str(device.to_string())];
        Ok(self.proxy.call_returning("AttachDevice", args)?)
    }

    pub fn remove_device(&self, name: &str) -> Result<()> {
        self.proxy.call("RemoveDevice", vec![Value::Str(name.to_string())])?;
        Ok(())
    }

    pub fn quit(&self) -> Result<()> {
        self.proxy.call("Quit", Vec::new())?;
        Ok(())
    }

    pub fn devices(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.proxy.get_as("Devices")?)
    }

    pub fn source_version(&self) -> Result<String> {
        Ok(self.proxy.get_as("SourceVersion")?)
    }

    pub fn build_info(&self) -> Result<String> {
        Ok(self.proxy.get_as("BuildInfo")?)
    }

    /// Called with the new device map whenever a device comes or goes.
    pub fn on_devices_changed(&self, handler: impl Fn(&BTreeMap<String, String>) + 'static) {
        self.proxy.connect_properties_changed(move |change| {
            let Some(value) = change.changed.get("Devices") else {
                return;
            };
            match BTreeMap::<String, String>::from_value(value.clone()) {
                Ok(devices) => handler(&devices),
                Err(err) => warn!(error = %err, "malformed Devices property dropped"),
            }
        });
    }
}
