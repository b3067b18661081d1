//! 按名称调用的能力接口
//!
//! Rust 没有运行时反射，模块通过 [`ClassDescriptor`] 声明可按名称加载的类：
//! 类名、实现的接口、声明的方法以及构造函数。服务对象实现 [`Invokable`]，
//! 以 `serde_json::Value` 作为参数和返回值进行动态调用。

use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// 调用方法的结果
pub type InvocationResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// 服务对象
pub type ServiceObject = Arc<dyn Invokable>;

/// 可按名称调用的服务对象
pub trait Invokable: Send + Sync + 'static {
    /// 对象实现的契约名称
    fn contracts(&self) -> Vec<String>;

    /// 按名称调用方法
    fn call(&self, method: &str, args: &[Value]) -> InvocationResult;

    /// 向下转型支持
    fn as_any(&self) -> &dyn Any;

    /// 实现类型名称
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// 是否实现指定契约
    fn implements(&self, contract: &str) -> bool {
        self.contracts().iter().any(|c| c == contract)
    }
}

/// 将服务对象转换为具体类型
pub fn downcast_service<T: Invokable>(service: &ServiceObject) -> Option<&T> {
    service.as_any().downcast_ref::<T>()
}

/// 判断两个服务对象是否为同一实例
pub fn same_instance(a: &ServiceObject, b: &ServiceObject) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// 方法参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// 任意值
    Any,
    /// 字符串
    String,
    /// 整数
    Integer,
    /// 浮点数（也接受整数）
    Float,
    /// 布尔值
    Bool,
    /// 数组
    Array,
    /// 对象
    Object,
}

impl ParamType {
    /// 检查值是否符合此类型
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// 方法可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    /// 公开
    #[default]
    Public,
    /// 模块私有
    Private,
}

/// 方法描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// 方法名
    pub name: String,
    /// 参数类型
    pub param_types: Vec<ParamType>,
    /// 可见性
    pub visibility: Visibility,
}

impl MethodDescriptor {
    /// 创建公开方法描述
    pub fn new(name: impl Into<String>, param_types: Vec<ParamType>) -> Self {
        Self {
            name: name.into(),
            param_types,
            visibility: Visibility::Public,
        }
    }

    /// 设置为私有方法
    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    /// 参数签名是否一致
    pub fn has_signature(&self, param_types: &[ParamType]) -> bool {
        self.param_types == param_types
    }
}

/// 构造函数，参数为可选的构造参数
pub type Constructor = Arc<
    dyn Fn(Option<&Value>) -> Result<ServiceObject, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// 类描述
///
/// 模块通过类描述暴露可按名称加载和实例化的实现
#[derive(Clone)]
pub struct ClassDescriptor {
    name: String,
    interfaces: Vec<String>,
    methods: Vec<MethodDescriptor>,
    constructor: Option<Constructor>,
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("interfaces", &self.interfaces)
            .field("methods", &self.methods)
            .field("constructor", &self.constructor.as_ref().map(|_| "<function>"))
            .finish()
    }
}

impl ClassDescriptor {
    /// 创建类描述（无构造函数时不可实例化）
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            methods: Vec::new(),
            constructor: None,
        }
    }

    /// 声明实现的接口
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// 声明方法
    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// 设置构造函数
    pub fn constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(Option<&Value>) -> Result<ServiceObject, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    /// 类名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 实现的接口
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// 声明的方法
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// 按名称查找方法
    pub fn find_method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// 构造函数
    pub fn constructor_fn(&self) -> Option<&Constructor> {
        self.constructor.as_ref()
    }
}
