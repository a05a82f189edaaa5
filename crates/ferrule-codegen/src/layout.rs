//! Source-level types and the in-memory layout of structures.
//!
//! Structures are laid out C-style: fields in declaration order, each at its
//! natural alignment, total size rounded up to the largest field alignment.
//! Nested structures are stored inline, so a structure that contains itself
//! has no finite size and is rejected.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use ferrule_types::ast::{StructDecl, TypeAnnotation, TypeKind};
use ferrule_types::{ErrorCode, FerruleError, Span};

use crate::linear::Shape;
use crate::types::ValType;

/// Type of a source-level value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    I32,
    I64,
    F32,
    F64,
    Bool,
    Struct(Rc<str>),
}

impl Ty {
    /// The WASM type a value of this type travels as. Structures travel as
    /// an `i32` address.
    pub fn val_type(&self) -> ValType {
        match self {
            Ty::I32 | Ty::Bool | Ty::Struct(_) => ValType::I32,
            Ty::I64 => ValType::I64,
            Ty::F32 => ValType::F32,
            Ty::F64 => ValType::F64,
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Ty::Struct(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Ty::I32 | Ty::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::F32 | Ty::F64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn struct_name(&self) -> Option<&str> {
        match self {
            Ty::Struct(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::I32 => write!(f, "i32"),
            Ty::I64 => write!(f, "i64"),
            Ty::F32 => write!(f, "f32"),
            Ty::F64 => write!(f, "f64"),
            Ty::Bool => write!(f, "bool"),
            Ty::Struct(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: Ty,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructLayout {
    pub name: Rc<str>,
    pub size: u32,
    pub align: u32,
    pub fields: Vec<FieldLayout>,
    pub shape: Shape,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Layouts of every structure in a program.
#[derive(Debug, Default)]
pub struct Layouts {
    structs: BTreeMap<Rc<str>, StructLayout>,
}

impl Layouts {
    /// Lay out every declared structure, reporting all problems at once.
    pub fn build(decls: &[StructDecl], file: &str) -> Result<Self, Vec<FerruleError>> {
        let mut builder = LayoutBuilder {
            file,
            decls: BTreeMap::new(),
            done: BTreeMap::new(),
            failed: BTreeSet::new(),
            errors: Vec::new(),
        };

        for decl in decls {
            let name = decl.name.name.as_str();
            if builder.decls.insert(name, decl).is_some() {
                builder.errors.push(FerruleError::new(
                    file,
                    ErrorCode::DUPLICATE_DECLARATION,
                    format!("struct `{name}` is declared more than once"),
                    decl.name.span,
                ));
            }
        }
        for decl in decls {
            builder.layout(decl.name.name.as_str());
        }

        if builder.errors.is_empty() {
            Ok(Self {
                structs: builder.done,
            })
        } else {
            Err(builder.errors)
        }
    }

    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.structs.get(name)
    }

    /// Resolve a written type to a [`Ty`].
    pub fn resolve(&self, ann: &TypeAnnotation, file: &str) -> Result<Ty, FerruleError> {
        match &ann.kind {
            TypeKind::I32 => Ok(Ty::I32),
            TypeKind::I64 => Ok(Ty::I64),
            TypeKind::F32 => Ok(Ty::F32),
            TypeKind::F64 => Ok(Ty::F64),
            TypeKind::Bool => Ok(Ty::Bool),
            TypeKind::Named(name) => self
                .structs
                .get_key_value(name.as_str())
                .map(|(key, _)| Ty::Struct(Rc::clone(key)))
                .ok_or_else(|| unknown_type(file, name, ann.span)),
        }
    }

    /// Byte size and alignment of a value of `ty` in linear memory.
    pub fn size_align(&self, ty: &Ty) -> (u32, u32) {
        match ty {
            Ty::Struct(name) => self
                .structs
                .get(name)
                .map_or((0, 1), |layout| (layout.size, layout.align)),
            Ty::Bool => (4, 4),
            other => {
                let size = other.val_type().size();
                (size, size)
            }
        }
    }

    pub fn shape(&self, ty: &Ty) -> Shape {
        match ty {
            Ty::Struct(name) => self
                .structs
                .get(name)
                .map_or_else(Shape::leaf, |layout| layout.shape.clone()),
            _ => Shape::leaf(),
        }
    }
}

fn unknown_type(file: &str, name: &str, span: Span) -> FerruleError {
    FerruleError::new(
        file,
        ErrorCode::UNKNOWN_TYPE,
        format!("unknown type `{name}`"),
        span,
    )
}

fn primitive(kind: &TypeKind) -> Option<Ty> {
    match kind {
        TypeKind::I32 => Some(Ty::I32),
        TypeKind::I64 => Some(Ty::I64),
        TypeKind::F32 => Some(Ty::F32),
        TypeKind::F64 => Some(Ty::F64),
        TypeKind::Bool => Some(Ty::Bool),
        TypeKind::Named(_) => None,
    }
}

struct LayoutBuilder<'a> {
    file: &'a str,
    decls: BTreeMap<&'a str, &'a StructDecl>,
    done: BTreeMap<Rc<str>, StructLayout>,
    failed: BTreeSet<&'a str>,
    errors: Vec<FerruleError>,
}

impl<'a> LayoutBuilder<'a> {
    /// Lay out `root` and everything it contains.
    ///
    /// The walk keeps an explicit stack of structures being laid out; meeting
    /// one of them again is a containment cycle.
    fn layout(&mut self, root: &'a str) {
        let mut visiting: Vec<&'a str> = Vec::new();
        self.visit(root, &mut visiting);
    }

    fn visit(&mut self, name: &'a str, visiting: &mut Vec<&'a str>) -> bool {
        if self.done.contains_key(name) {
            return true;
        }
        if self.failed.contains(name) {
            return false;
        }
        let Some(&decl) = self.decls.get(name) else {
            return false;
        };
        if let Some(start) = visiting.iter().position(|&v| v == name) {
            let mut cycle: Vec<&str> = visiting[start..].to_vec();
            cycle.push(name);
            self.errors.push(
                FerruleError::new(
                    self.file,
                    ErrorCode::RECURSIVE_STRUCT,
                    format!(
                        "struct `{name}` contains itself ({}) and has no finite size",
                        cycle.join(" -> ")
                    ),
                    decl.name.span,
                )
                .with_suggestion("break the cycle by storing one of the fields elsewhere"),
            );
            for member in &visiting[start..] {
                self.failed.insert(*member);
            }
            return false;
        }

        visiting.push(name);
        let mut ok = true;
        let mut seen = BTreeSet::new();
        let mut fields = Vec::with_capacity(decl.fields.len());
        for field in &decl.fields {
            if !seen.insert(field.name.name.as_str()) {
                self.errors.push(FerruleError::new(
                    self.file,
                    ErrorCode::DUPLICATE_FIELD,
                    format!("field `{}` is declared twice in `{name}`", field.name.name),
                    field.name.span,
                ));
                ok = false;
                continue;
            }
            let ty = match &field.type_ann.kind {
                TypeKind::Named(inner) => match self.decls.get_key_value(inner.as_str()) {
                    Some((&inner, _)) => {
                        if !self.visit(inner, visiting) {
                            ok = false;
                            continue;
                        }
                        match self.done.get_key_value(inner) {
                            Some((key, _)) => Ty::Struct(Rc::clone(key)),
                            None => {
                                ok = false;
                                continue;
                            }
                        }
                    }
                    None => {
                        self.errors
                            .push(unknown_type(self.file, inner, field.type_ann.span));
                        ok = false;
                        continue;
                    }
                },
                other => match primitive(other) {
                    Some(ty) => ty,
                    None => continue,
                },
            };
            fields.push((field.name.name.clone(), ty));
        }
        visiting.pop();

        if !ok || self.failed.contains(name) {
            self.failed.insert(name);
            return false;
        }
        let Some(layout) = self.place(name, fields) else {
            self.errors.push(
                FerruleError::new(
                    self.file,
                    ErrorCode::STRUCT_TOO_LARGE,
                    format!("struct `{name}` is larger than the 4 GiB address space"),
                    decl.name.span,
                )
                .with_suggestion("reduce the nesting or the number of fields"),
            );
            self.failed.insert(name);
            return false;
        };
        self.done.insert(Rc::clone(&layout.name), layout);
        true
    }

    /// `None` when an offset or the total size does not fit in `u32`.
    fn place(&self, name: &str, fields: Vec<(String, Ty)>) -> Option<StructLayout> {
        let mut offset = 0u32;
        let mut align = 1u32;
        let mut placed = Vec::with_capacity(fields.len());
        let mut shape = Vec::with_capacity(fields.len());
        for (field, ty) in fields {
            let (size, field_align) = match &ty {
                Ty::Struct(inner) => self
                    .done
                    .get(inner)
                    .map_or((0, 1), |l| (l.size, l.align)),
                Ty::Bool => (4, 4),
                other => (other.val_type().size(), other.val_type().size()),
            };
            offset = offset.checked_next_multiple_of(field_align)?;
            align = align.max(field_align);
            shape.push((
                field.clone(),
                match &ty {
                    Ty::Struct(inner) => self
                        .done
                        .get(inner)
                        .map_or_else(Shape::leaf, |l| l.shape.clone()),
                    _ => Shape::leaf(),
                },
            ));
            placed.push(FieldLayout {
                name: field,
                ty,
                offset,
            });
            offset = offset.checked_add(size)?;
        }
        Some(StructLayout {
            name: Rc::from(name),
            size: offset.checked_next_multiple_of(align)?,
            align,
            fields: placed,
            shape: Shape::composite(shape),
        })
    }
}
