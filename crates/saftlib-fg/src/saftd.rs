//! The device directory at `/de/gsi/saftlib`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use saftbus_core::{CallError, ObjectSpec, Service, Vtable, WeakService};
use saftbus_serial::{ArgReader, Value};
use tracing::{info, warn};

use crate::error::{FgError, Result};

pub const SAFTD_INTERFACE: &str = "de.gsi.saftlib.SAFTd";
pub const SAFTD_PATH: &str = "/de/gsi/saftlib";

/// Turns a device file into bus objects.
pub trait Driver {
    /// Probe `device` and register its objects under `object_path`.
    /// Returns object name to path for everything registered.
    fn attach(&self, service: &Service, device: &str, object_path: &str) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone)]
struct Device {
    file: String,
    object_path: String,
}

struct SaftdInner {
    service: WeakService,
    driver: Box<dyn Driver>,
    devices: RefCell<BTreeMap<String, Device>>,
    source_version: String,
    build_info: String,
}

/// Handle on the registered device directory.
#[derive(Clone)]
pub struct Saftd {
    inner: Rc<SaftdInner>,
}

impl std::fmt::Debug for Saftd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saftd")
            .field("devices", &self.inner.devices.borrow().len())
            .finish()
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Saftd {
    /// Register the directory on `service`, attaching devices through `driver`.
    pub fn register(service: &Service, driver: impl Driver + 'static) -> std::result::Result<Self, CallError> {
        let saftd = Self {
            inner: Rc::new(SaftdInner {
                service: service.downgrade(),
                driver: Box::new(driver),
                devices: RefCell::new(BTreeMap::new()),
                source_version: format!("saftlib-fg {}", env!("CARGO_PKG_VERSION")),
                build_info: format!(
                    "{} {} ({})",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION"),
                    std::env::consts::ARCH
                ),
            }),
        };
        service.register(ObjectSpec::new(SAFTD_PATH).interface(saftd.vtable()))?;
        Ok(saftd)
    }

    fn service(&self) -> Result<Service> {
        self.inner
            .service
            .upgrade()
            .ok_or_else(|| FgError::rejected("service is gone"))
    }

    /// Device name to object path.
    pub fn devices(&self) -> BTreeMap<String, String> {
        self.inner
            .devices
            .borrow()
            .iter()
            .map(|(name, device)| (name.clone(), device.object_path.clone()))
            .collect()
    }

    pub fn device_file(&self, name: &str) -> Option<String> {
        self.inner.devices.borrow().get(name).map(|d| d.file.clone())
    }

    pub fn attach_device(&self, name: &str, file: &str) -> Result<String> {
        if !valid_name(name) {
            return Err(FgError::invalid_args("Invalid name; [a-zA-Z0-9_] only"));
        }
        if self.inner.devices.borrow().contains_key(name) {
            return Err(FgError::invalid_args("device already exists"));
        }
        let service = self.service()?;
        let object_path = format!("{SAFTD_PATH}/{name}");
        match self.inner.driver.attach(&service, file, &object_path) {
            Ok(objects) => {
                info!(device = %name, file = %file, objects = objects.len(), "device attached");
            }
            Err(err) => {
                remove_under(&service, &object_path);
                return Err(err);
            }
        }
        self.inner.devices.borrow_mut().insert(
            name.to_string(),
            Device {
                file: file.to_string(),
                object_path: object_path.clone(),
            },
        );
        self.announce(&service);
        Ok(object_path)
    }

    pub fn remove_device(&self, name: &str) -> Result<()> {
        let device = self
            .inner
            .devices
            .borrow_mut()
            .remove(name)
            .ok_or_else(|| FgError::invalid_args("no such device"))?;
        let service = self.service()?;
        remove_under(&service, &device.object_path);
        info!(device = %name, "device removed");
        self.announce(&service);
        Ok(())
    }

    fn announce(&self, service: &Service) {
        let mut changed = BTreeMap::new();
        changed.insert("Devices".to_string(), self.devices_value());
        service.properties_changed(SAFTD_PATH, SAFTD_INTERFACE, changed);
    }

    fn devices_value(&self) -> Value {
        Value::Map(
            self.devices()
                .into_iter()
                .map(|(name, path)| (name, Value::Str(path)))
                .collect(),
        )
    }

    fn vtable(&self) -> Vtable {
        let attach = self.clone();
        let remove = self.clone();
        let devices = self.clone();
        let version = self.inner.source_version.clone();
        let build = self.inner.build_info.clone();

        Vtable::new(SAFTD_INTERFACE)
            .method("AttachDevice", "ss", "s", move |_, args| {
                let mut args = ArgReader::new(args);
                let name: String = args.next()?;
                let file: String = args.next()?;
                args.finish()?;
                Ok(vec![Value::Str(attach.attach_device(&name, &file)?)])
            })
            .method("RemoveDevice", "s", "", move |_, args| {
                let mut args = ArgReader::new(args);
                let name: String = args.next()?;
                args.finish()?;
                remove.remove_device(&name)?;
                Ok(Vec::new())
            })
            .method("Quit", "", "", |ctx, _| {
                if !ctx.is_privileged() {
                    return Err(CallError::permission_denied("Quit requires a privileged caller"));
                }
                ctx.service().request_quit();
                Ok(Vec::new())
            })
            .property("Devices", "a{ss}", move || Ok(devices.devices_value()))
            .property("SourceVersion", "s", move || Ok(Value::Str(version.clone())))
            .property("BuildInfo", "s", move || Ok(Value::Str(build.clone())))
    }
}

/// Remove every object at or below `prefix`, deepest first.
fn remove_under(service: &Service, prefix: &str) {
    let mut paths = service.object_paths_under(prefix);
    paths.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));
    for path in paths {
        if let Err(err) = service.remove_object(&path) {
            warn!(path = %path, error = %err, "object removal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saftbus_core::EventLoop;

    struct OneObject;

    impl Driver for OneObject {
        fn attach(&self, service: &Service, device: &str, object_path: &str) -> Result<BTreeMap<String, String>> {
            if device == "/dev/broken" {
                service.register(ObjectSpec::new(format!("{object_path}/half")).interface(Vtable::new("x.Half")))?;
                return Err(FgError::Hardware("probe failed".into()));
            }
            let path = format!("{object_path}/thing");
            service.register(ObjectSpec::new(path.clone()).interface(Vtable::new("x.Thing")))?;
            Ok(BTreeMap::from([("thing".to_string(), path)]))
        }
    }

    #[test]
    fn names_are_validated_and_unique() {
        let service = Service::new(EventLoop::new());
        let saftd = Saftd::register(&service, OneObject).unwrap();

        for bad in ["", "tr-0", "tr 0", "tr/0"] {
            let err = saftd.attach_device(bad, "/dev/wbm0").unwrap_err();
            assert_eq!(err.to_string(), "invalid arguments: Invalid name; [a-zA-Z0-9_] only");
        }
        assert_eq!(saftd.attach_device("tr_0", "/dev/wbm0").unwrap(), "/de/gsi/saftlib/tr_0");
        assert!(service.has_object("/de/gsi/saftlib/tr_0/thing"));
        let err = saftd.attach_device("tr_0", "/dev/wbm1").unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments: device already exists");
        assert_eq!(saftd.device_file("tr_0").as_deref(), Some("/dev/wbm0"));
    }

    #[test]
    fn remove_device_drops_its_objects() {
        let service = Service::new(EventLoop::new());
        let saftd = Saftd::register(&service, OneObject).unwrap();
        saftd.attach_device("tr0", "/dev/wbm0").unwrap();
        saftd.remove_device("tr0").unwrap();

        assert!(!service.has_object("/de/gsi/saftlib/tr0/thing"));
        assert!(service.has_object(SAFTD_PATH));
        assert!(saftd.devices().is_empty());
        let err = saftd.remove_device("tr0").unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments: no such device");
    }

    #[test]
    fn failed_probe_leaves_nothing_behind() {
        let service = Service::new(EventLoop::new());
        let saftd = Saftd::register(&service, OneObject).unwrap();
        assert!(saftd.attach_device("bad", "/dev/broken").is_err());
        assert!(service.object_paths_under("/de/gsi/saftlib/bad").is_empty());
        assert!(saftd.devices().is_empty());
    }
}
