//! Runtime tunable properties.
//!
//! Configuration structures expose a subset of their fields as named, bounded properties. This
//! allows frontends to adjust thresholds between frames without knowing the concrete structure.

use anyhow::{anyhow, Result};
use std::ops::{Deref, DerefMut};

/// Object with tunable properties.
pub trait Properties {
    /// Get available properties.
    fn props_mut(&mut self) -> Vec<(&str, PropertyMut)> {
        vec![]
    }

    /// Get a snapshot of the available properties.
    fn props(&mut self) -> Vec<(&str, Property)> {
        self.props_mut()
            .into_iter()
            .map(|(n, p)| (n, p.into()))
            .collect()
    }

    /// Parse and set a property by name.
    ///
    /// Numeric values are clamped to the bounds of the property.
    ///
    /// # Arguments
    ///
    /// * `name` - name of the property (case insensitive).
    /// * `value` - textual representation of the new value.
    fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        let mut props = self.props_mut();

        let (_, prop) = props
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("unknown property '{}'", name))?;

        prop.parse_set(value)
    }
}

/// Property with a lower and upper bound.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct BoundedProp<T> {
    pub val: T,
    pub min: T,
    pub max: T,
}

impl<T> Deref for BoundedProp<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.val
    }
}

impl<'a, T: Copy> From<BoundedPropMut<'a, T>> for BoundedProp<T> {
    fn from(BoundedPropMut { val, min, max }: BoundedPropMut<'a, T>) -> Self {
        Self {
            val: *val,
            min,
            max,
        }
    }
}

/// Describes the type and current value of a property.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum Property {
    Bool(bool),
    Float(BoundedProp<f32>),
    Usize(BoundedProp<usize>),
}

impl<'a> From<PropertyMut<'a>> for Property {
    fn from(prop: PropertyMut<'a>) -> Self {
        match prop {
            PropertyMut::Bool(b) => Self::Bool(*b),
            PropertyMut::Float(p) => Self::Float(p.into()),
            PropertyMut::Usize(p) => Self::Usize(p.into()),
        }
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Float(p) => write!(f, "{} [{}; {}]", p.val, p.min, p.max),
            Self::Usize(p) => write!(f, "{} [{}; {}]", p.val, p.min, p.max),
        }
    }
}

/// Mutable reference to a bounded value.
pub struct BoundedPropMut<'a, T> {
    pub val: &'a mut T,
    pub min: T,
    pub max: T,
}

impl<'a, T> Deref for BoundedPropMut<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.val
    }
}

impl<'a, T> DerefMut for BoundedPropMut<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.val
    }
}

impl<'a, T: PartialOrd + Copy> BoundedPropMut<'a, T> {
    /// Set the value, clamped between the lower and upper bounds.
    pub fn set_clamped(&mut self, val: T) {
        *self.val = if val < self.min {
            self.min
        } else if val > self.max {
            self.max
        } else {
            val
        };
    }
}

/// Mutable handle to a property.
pub enum PropertyMut<'a> {
    Bool(&'a mut bool),
    Float(BoundedPropMut<'a, f32>),
    Usize(BoundedPropMut<'a, usize>),
}

impl<'a> PropertyMut<'a> {
    /// Create a boolean property.
    ///
    /// # Arguments
    ///
    /// * `b` - reference to the underlying boolean to be mutated.
    pub fn bool(b: &'a mut bool) -> Self {
        Self::Bool(b)
    }

    /// Create a floating point property.
    ///
    /// # Arguments
    ///
    /// * `val` - reference to the underlying float to be mutated.
    /// * `min` - lowest value for the property.
    /// * `max` - highest value for the property.
    pub fn float(val: &'a mut f32, min: f32, max: f32) -> Self {
        Self::Float(BoundedPropMut { val, min, max })
    }

    /// Create an integer property.
    ///
    /// # Arguments
    ///
    /// * `val` - reference to the underlying usize to be mutated.
    /// * `min` - lowest value for the property.
    /// * `max` - highest value for the property.
    pub fn usize(val: &'a mut usize, min: usize, max: usize) -> Self {
        Self::Usize(BoundedPropMut { val, min, max })
    }

    /// Copy the value of a property snapshot of the same type.
    pub fn set(&mut self, other: &Property) {
        match (self, other) {
            (Self::Bool(b), Property::Bool(ob)) => **b = *ob,
            (Self::Float(val), Property::Float(oval)) => val.set_clamped(oval.val),
            (Self::Usize(val), Property::Usize(oval)) => val.set_clamped(oval.val),
            _ => {}
        }
    }

    /// Parse a textual value and assign it.
    pub fn parse_set(&mut self, value: &str) -> Result<()> {
        let value = value.trim();

        match self {
            Self::Bool(b) => **b = value.parse()?,
            Self::Float(p) => {
                let v: f32 = value.parse()?;
                if !v.is_finite() {
                    return Err(anyhow!("non-finite value '{}'", value));
                }
                p.set_clamped(v)
            }
            Self::Usize(p) => p.set_clamped(value.parse()?),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Tunables {
        enabled: bool,
        gain: f32,
        count: usize,
    }

    impl Properties for Tunables {
        fn props_mut(&mut self) -> Vec<(&str, PropertyMut)> {
            vec![
                ("Enabled", PropertyMut::bool(&mut self.enabled)),
                ("Gain", PropertyMut::float(&mut self.gain, 0.0, 2.0)),
                ("Count", PropertyMut::usize(&mut self.count, 1, 8)),
            ]
        }
    }

    #[test]
    fn parse_and_clamp() {
        let mut t = Tunables::default();

        t.set_property("enabled", "true").unwrap();
        t.set_property("Gain", "5.5").unwrap();
        t.set_property("COUNT", "0").unwrap();

        assert!(t.enabled);
        assert_eq!(t.gain, 2.0);
        assert_eq!(t.count, 1);

        assert!(t.set_property("Gain", "abc").is_err());
        assert!(t.set_property("Gain", "NaN").is_err());
        assert!(t.set_property("Missing", "1").is_err());
    }

    #[test]
    fn snapshot() {
        let mut t = Tunables::default();
        let props = t.props();
        assert_eq!(props.len(), 3);
        assert_eq!(
            props[1].1,
            Property::Float(BoundedProp {
                val: 0.0,
                min: 0.0,
                max: 2.0
            })
        );

        let mut props_mut = t.props_mut();
        props_mut[2].1.set(&Property::Usize(BoundedProp {
            val: 20,
            min: 0,
            max: 100,
        }));
        drop(props_mut);
        assert_eq!(t.count, 8);
    }
}
