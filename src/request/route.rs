// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::Request;

/// Type-erased async step of a route.
pub type HandlerFn = Arc<dyn Fn(Request) -> BoxFuture<'static, ()> + Send + Sync>;

/// Behaviour bound to one message id: optional pre-handle, handle and
/// post-handle steps, run in that order. A missing step is skipped.
///
/// ```ignore
/// let route = Route::new()
///     .pre_handle(|req: Request| async move { tracing::debug!("got {}", req.msg_id()) })
///     .handle(|req: Request| async move {
///         let _ = req.connection().send_msg(req.msg_id(), req.data()).await;
///     });
/// ```
#[derive(Clone, Default)]
pub struct Route {
    pre_handle: Option<HandlerFn>,
    handle: Option<HandlerFn>,
    post_handle: Option<HandlerFn>,
}

fn erase<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |request| f(request).boxed())
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_handle<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.pre_handle = Some(erase(f));
        self
    }

    pub fn handle<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle = Some(erase(f));
        self
    }

    pub fn post_handle<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.post_handle = Some(erase(f));
        self
    }

    pub(crate) async fn run(&self, request: Request) {
        if let Some(pre_handle) = &self.pre_handle {
            pre_handle(request.clone()).await;
        }
        if let Some(handle) = &self.handle {
            handle(request.clone()).await;
        }
        if let Some(post_handle) = &self.post_handle {
            post_handle(request).await;
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pre_handle", &self.pre_handle.is_some())
            .field("handle", &self.handle.is_some())
            .field("post_handle", &self.post_handle.is_some())
            .finish()
    }
}
