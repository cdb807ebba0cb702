use std::collections::HashMap;

use crate::client::LLMClient;
use crate::error::LLMError;
use crate::middleware::Stack;
use crate::provider::DynProvider;
use crate::types::CapabilityDescriptor;

/// 按句柄维护已注册的 Provider
///
/// 注册表只负责查找, 真正的调用通过 [`ProviderRegistry::client`] 得到的 [`LLMClient`] 完成。
/// 切换 Provider 只需要换一个句柄, 调用方代码不需要改动。
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, DynProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个句柄对应的 Provider, 同名句柄会被覆盖
    pub fn register<S: Into<String>>(mut self, handle: S, provider: DynProvider) -> Self {
        self.insert(handle, provider);
        self
    }

    /// 就地注册, 返回被替换掉的旧 Provider
    pub fn insert<S: Into<String>>(
        &mut self,
        handle: S,
        provider: DynProvider,
    ) -> Option<DynProvider> {
        let handle = handle.into();
        tracing::debug!(handle = %handle, provider = provider.name(), "provider registered");
        self.providers.insert(handle, provider)
    }

    pub fn get(&self, handle: &str) -> Result<DynProvider, LLMError> {
        self.providers
            .get(handle)
            .cloned()
            .ok_or_else(|| LLMError::invalid_request(format!("unknown provider handle: {handle}")))
    }

    /// 返回当前已注册的句柄, 按字典序排列
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.providers.keys().cloned().collect();
        handles.sort();
        handles
    }

    /// 查询指定句柄的能力描述
    pub fn capabilities(&self, handle: &str) -> Result<CapabilityDescriptor, LLMError> {
        Ok(self.get(handle)?.capabilities())
    }

    /// 返回所有支持工具调用的句柄列表
    pub fn handles_supporting_tools(&self) -> Vec<String> {
        self.handles_where(|caps| caps.supports_tools)
    }

    /// 返回所有支持流式输出的句柄列表
    pub fn handles_supporting_stream(&self) -> Vec<String> {
        self.handles_where(|caps| caps.supports_stream)
    }

    /// 用给定中间件栈包装句柄对应的 Provider 并构建客户端
    pub fn client(&self, handle: &str, stack: &Stack) -> Result<LLMClient, LLMError> {
        let provider = self.get(handle)?;
        Ok(LLMClient::builder(provider).stack(stack.clone()).build())
    }

    fn handles_where(&self, keep: impl Fn(&CapabilityDescriptor) -> bool) -> Vec<String> {
        let mut handles: Vec<String> = self
            .providers
            .iter()
            .filter_map(|(handle, provider)| {
                if keep(&provider.capabilities()) {
                    Some(handle.clone())
                } else {
                    None
                }
            })
            .collect();
        handles.sort();
        handles
    }
}
