// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Variant array.
//!
//! Grounded on `RMonoVariantArray_Def.h`: either null (a raw null
//! pointer argument, e.g. `mono_runtime_invoke` called with no
//! parameters) or a list of [`Variant`]s, marshalled by the wrapper one
//! element at a time with a sentinel bit on the last element so the
//! generated loop needs no separate counter.

use crate::variant::Variant;

#[derive(Clone, Debug, Default)]
pub struct VariantArray(Option<Vec<Variant>>);

impl VariantArray {
    pub fn null() -> Self {
        VariantArray(None)
    }

    pub fn new(items: Vec<Variant>) -> Self {
        VariantArray(Some(items))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variant> {
        match &self.0 {
            Some(v) => v.iter(),
            None => [].iter(),
        }
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Variant> {
        match &mut self.0 {
            Some(v) => v.iter_mut(),
            None => [].iter_mut(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Variant> {
        self.0.as_ref().and_then(|v| v.get(index))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Variant> {
        self.0.as_mut().and_then(|v| v.get_mut(index))
    }

    /// Whether `index` is the last element: callers use this to set the
    /// sentinel "last flags" bit the wrapper's loop terminates on
    ///, rather than uploading a separate count.
    pub fn is_last(&self, index: usize) -> bool {
        match &self.0 {
            Some(v) => index + 1 == v.len(),
            None => false,
        }
    }
}

impl From<Vec<Variant>> for VariantArray {
    fn from(v: Vec<Variant>) -> Self {
        VariantArray(Some(v))
    }
}

impl IntoIterator for VariantArray {
    type Item = Variant;
    type IntoIter = std::vec::IntoIter<Variant>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.unwrap_or_default().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_array_has_no_elements() {
        let arr = VariantArray::null();
        assert!(arr.is_null());
        assert_eq!(arr.len(), 0);
    }

    #[test]
    fn last_element_sentinel() {
        let arr = VariantArray::new(vec![Variant::invalid(), Variant::invalid()]);
        assert!(!arr.is_last(0));
        assert!(arr.is_last(1));
    }
}
