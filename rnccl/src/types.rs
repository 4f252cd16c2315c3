/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Element data types accepted by collective operations.
///
/// Discriminants are the runtime's wire tags (`ncclDataType_t`), so a tag
/// received from the host surface decodes with [`DataType::from_tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    I8 = 0,
    U8 = 1,
    I32 = 2,
    U32 = 3,
    I64 = 4,
    U64 = 5,
    F16 = 6,
    F32 = 7,
    F64 = 8,
    BF16 = 9,
}

impl DataType {
    /// Every supported type, in tag order.
    pub const ALL: [DataType; 10] = [
        DataType::I8,
        DataType::U8,
        DataType::I32,
        DataType::U32,
        DataType::I64,
        DataType::U64,
        DataType::F16,
        DataType::F32,
        DataType::F64,
        DataType::BF16,
    ];

    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(
            self,
            DataType::F16 | DataType::BF16 | DataType::F32 | DataType::F64
        )
    }

    /// The runtime's numeric tag for this type.
    pub const fn tag(self) -> i32 {
        self as i32
    }

    /// Decode a runtime data-type tag. Unknown tags yield `None`.
    pub fn from_tag(tag: i32) -> Option<DataType> {
        DataType::ALL.into_iter().find(|dt| dt.tag() == tag)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tag of a reduction operator created at runtime (for example a
/// pre-multiplied sum). Only meaningful on the communicator that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CustomReduce(u32);

impl CustomReduce {
    /// First tag the runtime hands out for user-created operators.
    pub const FIRST_TAG: u32 = 5;

    pub fn from_tag(tag: u32) -> Option<Self> {
        (tag >= Self::FIRST_TAG).then_some(Self(tag))
    }

    pub fn tag(self) -> u32 {
        self.0
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
    /// Element-wise mean across ranks. Floating-point types only.
    Avg,
    /// Operator created on a communicator, see
    /// [`Communicator::create_premul_sum`](crate::Communicator::create_premul_sum).
    Custom(CustomReduce),
}

impl ReduceOp {
    /// The runtime's numeric tag (`ncclRedOp_t`).
    pub fn tag(self) -> i32 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Prod => 1,
            ReduceOp::Max => 2,
            ReduceOp::Min => 3,
            ReduceOp::Avg => 4,
            ReduceOp::Custom(c) => c.tag() as i32,
        }
    }

    /// Decode a runtime operator tag. Negative tags yield `None`; tags past the
    /// built-in range decode as [`ReduceOp::Custom`] and are checked against
    /// the communicator's registrations at dispatch.
    pub fn from_tag(tag: i32) -> Option<ReduceOp> {
        match tag {
            0 => Some(ReduceOp::Sum),
            1 => Some(ReduceOp::Prod),
            2 => Some(ReduceOp::Max),
            3 => Some(ReduceOp::Min),
            4 => Some(ReduceOp::Avg),
            t if t > 4 => CustomReduce::from_tag(t as u32).map(ReduceOp::Custom),
            _ => None,
        }
    }

    /// Whether a built-in operator is defined for `dtype`. Custom operators
    /// are validated against their registration instead and report `true`.
    pub fn supports(self, dtype: DataType) -> bool {
        match self {
            ReduceOp::Avg => dtype.is_float(),
            _ => true,
        }
    }
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
            ReduceOp::Avg => f.write_str("avg"),
            ReduceOp::Custom(c) => write!(f, "custom#{}", c.tag()),
        }
    }
}

/// Host element types that map onto a [`DataType`].
pub trait Element: Copy + Send + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_element!(
    i8 => I8,
    u8 => U8,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    half::f16 => F16,
    f32 => F32,
    f64 => F64,
    half::bf16 => BF16,
);
