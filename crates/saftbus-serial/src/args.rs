use crate::error::{Result, SerialError};
use crate::value::{FromValue, Value};

/// Sequential typed access to a method's argument list.
///
/// ```
/// use saftbus_serial::{ArgReader, Value};
///
/// let args = [Value::Str("tr0".into()), Value::UInt32(5)];
/// let mut reader = ArgReader::new(&args);
/// let name: String = reader.next().unwrap();
/// let slot: u32 = reader.next().unwrap();
/// reader.finish().unwrap();
/// assert_eq!((name.as_str(), slot), ("tr0", 5));
/// ```
#[derive(Debug)]
pub struct ArgReader<'a> {
    args: &'a [Value],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(args: &'a [Value]) -> Self {
        Self { args, pos: 0 }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next<T: FromValue>(&mut self) -> Result<T> {
        let value = self
            .args
            .get(self.pos)
            .ok_or(SerialError::MissingArgument(self.pos))?;
        self.pos += 1;
        T::from_value(value.clone())
    }

    /// Fail if arguments remain unread.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.args.len() {
            return Err(SerialError::UnexpectedArguments {
                expected: self.pos,
                found: self.args.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_argument_reports_index() {
        let args = [Value::Bool(true)];
        let mut reader = ArgReader::new(&args);
        assert!(reader.next::<bool>().unwrap());
        assert!(matches!(
            reader.next::<bool>(),
            Err(SerialError::MissingArgument(1))
        ));
    }

    #[test]
    fn extra_arguments_are_rejected() {
        let args = [Value::Bool(true), Value::Bool(false)];
        let mut reader = ArgReader::new(&args);
        reader.next::<bool>().unwrap();
        assert!(matches!(
            reader.finish(),
            Err(SerialError::UnexpectedArguments {
                expected: 1,
                found: 2
            })
        ));
    }
}
