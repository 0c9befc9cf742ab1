mod commons;
mod notification_delivery;
mod subscription_lifecycle;
