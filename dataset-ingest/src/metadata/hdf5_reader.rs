use std::path::Path;

use hdf5::types::{FixedAscii, FixedUnicode, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, File, H5Type};
use tracing::debug;

use super::{AttributeValue, ContainerReader, ExtractError};

// Fixed-length strings are converted into a buffer this wide; longer ones fail to read
const MAX_FIXED_STRING: usize = 4096;

/// Reads root attributes with libhdf5.
pub struct Hdf5Reader;

impl ContainerReader for Hdf5Reader {
    fn root_attributes(&self, path: &Path) -> Result<Vec<(String, AttributeValue)>, ExtractError> {
        let file = File::open(path).map_err(|e| ExtractError::Container(e.to_string()))?;
        let names = file
            .attr_names()
            .map_err(|e| ExtractError::Container(e.to_string()))?;

        let mut attributes = Vec::with_capacity(names.len());
        for name in names {
            let attribute_error = |e: hdf5::Error| ExtractError::Attribute {
                name: name.clone(),
                message: e.to_string(),
            };
            let attr = file.attr(&name).map_err(attribute_error)?;
            match read_attribute(&attr).map_err(attribute_error)? {
                Some(value) => attributes.push((name, value)),
                None => debug!(attribute = %name, "skipping attribute with unsupported type or shape"),
            }
        }

        Ok(attributes)
    }
}

fn read_attribute(attr: &Attribute) -> hdf5::Result<Option<AttributeValue>> {
    let scalar = attr.is_scalar();
    if !scalar && attr.ndim() != 1 {
        return Ok(None);
    }

    let value = match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenUnicode => {
            read_as::<VarLenUnicode>(attr, scalar, |s| AttributeValue::Text(s.as_str().to_string()))?
        }
        TypeDescriptor::VarLenAscii => {
            read_as::<VarLenAscii>(attr, scalar, |s| AttributeValue::Text(s.as_str().to_string()))?
        }
        TypeDescriptor::FixedAscii(_) => read_as::<FixedAscii<MAX_FIXED_STRING>>(attr, scalar, |s| {
            AttributeValue::Bytes(s.as_bytes().to_vec())
        })?,
        TypeDescriptor::FixedUnicode(_) => {
            read_as::<FixedUnicode<MAX_FIXED_STRING>>(attr, scalar, |s| {
                AttributeValue::Text(s.as_str().to_string())
            })?
        }
        TypeDescriptor::Integer(_) => read_as::<i64>(attr, scalar, AttributeValue::Int)?,
        TypeDescriptor::Unsigned(_) => read_as::<u64>(attr, scalar, AttributeValue::UInt)?,
        TypeDescriptor::Float(_) => read_as::<f64>(attr, scalar, AttributeValue::Float)?,
        TypeDescriptor::Boolean => read_as::<bool>(attr, scalar, AttributeValue::Bool)?,
        _ => return Ok(None),
    };

    Ok(Some(value))
}

fn read_as<T: H5Type>(
    attr: &Attribute,
    scalar: bool,
    convert: impl Fn(T) -> AttributeValue,
) -> hdf5::Result<AttributeValue> {
    if scalar {
        Ok(convert(attr.read_scalar::<T>()?))
    } else {
        Ok(AttributeValue::Array(
            attr.read_raw::<T>()?.into_iter().map(convert).collect(),
        ))
    }
}
