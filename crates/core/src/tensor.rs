use std::{cell::RefCell, fmt};

use crate::dim::{Dimension, Dimensions};
use rand::{
    distributions::Standard, prelude::Distribution, rngs::StdRng, thread_rng, Rng, SeedableRng,
};

thread_local!(static RNG: RefCell<StdRng> =
    RefCell::new(StdRng::from_rng(thread_rng()).expect("Failed to seed StdRng.")));

/// A dense, contiguous, row-major tensor owning its buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: Dimensions,
    stride: Dimensions,
    data: Vec<u8>,
    elem_ty: TensorElemType,
}

/// Represents a type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedShape {
    pub dims: Dimensions,
    pub elem_ty: TensorElemType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorElemType {
    F32,
    I64,
}

pub trait TensorElemTypeExt: PartialEq + PartialOrd + Copy {
    fn get_type() -> TensorElemType;
    fn zero() -> Self;
}

impl Tensor {
    pub fn new<T: TensorElemTypeExt>(dims: Dimensions, data: Vec<T>) -> Self {
        let data = std::mem::ManuallyDrop::new(data);
        Self {
            stride: dims.strides(),
            elem_ty: T::get_type(),
            data: unsafe {
                Vec::from_raw_parts(
                    data.as_ptr() as *mut u8,
                    data.len() * std::mem::size_of::<T>(),
                    data.capacity() * std::mem::size_of::<T>(),
                )
            },
            dims,
        }
    }

    pub fn zeros<T: TensorElemTypeExt>(dims: Dimensions) -> Self {
        let total_elems = dims.total_elems();
        Self::new(dims, vec![T::zero(); total_elems])
    }

    pub fn zeros_of_type(ty: TensorElemType, dims: Dimensions) -> Self {
        let total_elems = dims.total_elems();
        match ty {
            TensorElemType::F32 => Self::new(dims, vec![0.0f32; total_elems]),
            TensorElemType::I64 => Self::new(dims, vec![0i64; total_elems]),
        }
    }

    pub fn rand<T>(dims: Dimensions) -> Self
    where
        T: TensorElemTypeExt,
        Standard: Distribution<T>,
    {
        let total_elems = dims.total_elems();
        Self::new(
            dims,
            RNG.with(|r| {
                (&mut *r.borrow_mut())
                    .sample_iter(Standard)
                    .take(total_elems)
                    .collect::<Vec<T>>()
            }),
        )
    }

    pub fn seed_rng_from_u64(seed: u64) {
        RNG.with(|r| *r.borrow_mut() = StdRng::seed_from_u64(seed));
    }

    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    pub fn strides(&self) -> &[Dimension] {
        self.stride.as_slice()
    }

    pub fn elem_ty(&self) -> TensorElemType {
        self.elem_ty
    }

    pub fn data<T: TensorElemTypeExt>(&self) -> &[T] {
        assert_eq!(self.elem_ty, T::get_type());
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr() as *const T,
                self.data.len() / std::mem::size_of::<T>(),
            )
        }
    }

    pub fn data_mut<T: TensorElemTypeExt>(&mut self) -> &mut [T] {
        assert_eq!(self.elem_ty, T::get_type());
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_mut_ptr() as *mut T,
                self.data.len() / std::mem::size_of::<T>(),
            )
        }
    }

    pub fn set_raw_vec<T: TensorElemTypeExt>(&mut self, data: Vec<T>) {
        assert_eq!(self.elem_ty, T::get_type());
        let data = std::mem::ManuallyDrop::new(data);
        self.data = unsafe {
            Vec::from_raw_parts(
                data.as_ptr() as *mut u8,
                data.len() * std::mem::size_of::<T>(),
                data.capacity() * std::mem::size_of::<T>(),
            )
        };
    }

    /// Element-wise closeness for f32 tensors: |a - b| <= atol + rtol * |b|.
    /// Shapes must agree exactly.
    pub fn allclose(&self, other: &Self, rtol: f32, atol: f32) -> bool {
        if self.elem_ty != TensorElemType::F32
            || other.elem_ty != TensorElemType::F32
            || self.dims != other.dims
        {
            return false;
        }
        self.data::<f32>()
            .iter()
            .zip(other.data::<f32>())
            .all(|(&a, &b)| {
                (a - b).abs() <= atol + rtol * b.abs()
                    || (a.is_infinite()
                        && b.is_infinite()
                        && a.is_sign_positive() == b.is_sign_positive())
            })
    }

    pub fn verify(&self) -> bool {
        self.data.len() / self.elem_ty.size() == self.dims.total_elems()
    }
}

impl TypedShape {
    pub fn new(dims: Dimensions, elem_ty: TensorElemType) -> Self {
        Self { dims, elem_ty }
    }
}

impl TensorElemType {
    pub fn size(&self) -> usize {
        match self {
            TensorElemType::F32 => std::mem::size_of::<f32>(),
            TensorElemType::I64 => std::mem::size_of::<i64>(),
        }
    }

    pub fn is_f32(&self) -> bool {
        matches!(self, Self::F32)
    }

    pub fn is_i64(&self) -> bool {
        matches!(self, Self::I64)
    }
}

impl TensorElemTypeExt for f32 {
    fn get_type() -> TensorElemType {
        TensorElemType::F32
    }

    fn zero() -> Self {
        0f32
    }
}

impl TensorElemTypeExt for i64 {
    fn get_type() -> TensorElemType {
        TensorElemType::I64
    }

    fn zero() -> Self {
        0i64
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dump<T: fmt::Debug>(f: &mut fmt::Formatter<'_>, data: &[T]) -> fmt::Result {
            const MAX_ELEMS: usize = 10;
            if data.len() > MAX_ELEMS {
                write!(f, "[")?;
                for e in data[0..MAX_ELEMS / 2].iter() {
                    write!(f, "{e:?}, ")?;
                }
                write!(f, "...")?;
                for e in data[data.len() - MAX_ELEMS / 2..].iter() {
                    write!(f, ", {e:?}")?;
                }
                write!(f, "]")
            } else {
                write!(f, "{data:?}")
            }
        }

        write!(f, "Tensor({:?}, {:?}, ", self.dims, self.elem_ty)?;
        match self.elem_ty {
            TensorElemType::F32 => dump(f, self.data::<f32>())?,
            TensorElemType::I64 => dump(f, self.data::<i64>())?,
        }
        write!(f, ")")
    }
}

#[test]
fn create_tensors() {
    assert!(Tensor::zeros::<f32>(vec![1, 12, 64, 64].into()).verify());
    assert!(Tensor::zeros::<i64>(vec![1, 12, 64, 64].into()).verify());
    let t = Tensor::new(vec![2, 2].into(), vec![1.0f32, 2.0, 3.0, 4.0]);
    assert!(t.verify());
    assert_eq!(t.strides(), &[2, 1]);
}

#[test]
fn test_zeros() {
    let zeros = Tensor::zeros::<f32>(vec![1, 4, 28, 28].into());
    assert!(zeros.data::<f32>().iter().all(|&x| x == 0.));
}

#[test]
fn test_rand_seeded() {
    Tensor::seed_rng_from_u64(42);
    let x = Tensor::rand::<f32>(vec![3, 6, 2, 9].into());
    Tensor::seed_rng_from_u64(42);
    let y = Tensor::rand::<f32>(vec![3, 6, 2, 9].into());
    assert_eq!(x, y);
}

#[test]
fn test_allclose() {
    let x = Tensor::new(vec![3].into(), vec![1.0f32, 2.0, 3.0]);
    let y = Tensor::new(vec![3].into(), vec![1.0f32, 2.0, 3.00001]);
    assert!(x.allclose(&y, 1e-4, 1e-4));
    let z = Tensor::new(vec![3].into(), vec![1.0f32, 2.0, 3.1]);
    assert!(!x.allclose(&z, 1e-4, 1e-4));
}

#[test]
fn test_data_mut() {
    let mut t = Tensor::zeros::<f32>(vec![2].into());
    t.data_mut::<f32>()[1] = 5.0;
    assert_eq!(t.data::<f32>(), &[0.0, 5.0]);
}
